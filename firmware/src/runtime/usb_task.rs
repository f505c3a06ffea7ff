use embassy_futures::join::{join, join3};
use embassy_futures::select::{Either3, select3};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_usb::driver::EndpointError;
use rover_core::dispatch::{Routed, route_frame};
use rover_core::session::{ChannelName, JoinOutcome, SessionHandle};

use super::{QUEUE, SESSIONS, TELEMETRY, USB_STORAGE, port_link};
use crate::telemetry::TelemetryEventKind;
use crate::usb::{
    self, FrameAssembler, INBOUND_FRAME_LEN, OutboundCursor, UsbDeviceStrings, UsbTransport,
};

embassy_stm32::bind_interrupts!(struct UsbIrqs {
    USB_UCPD1_2 => embassy_stm32::usb::InterruptHandler<hal::peripherals::USB>;
});

#[embassy_executor::task]
pub async fn run(
    usb: Peri<'static, hal::peripherals::USB>,
    dp: Peri<'static, hal::peripherals::PA12>,
    dm: Peri<'static, hal::peripherals::PA11>,
) -> ! {
    let storage = USB_STORAGE.init(usb::UsbDeviceStorage::new());
    let driver = embassy_stm32::usb::Driver::new(usb, UsbIrqs, dp, dm);

    let mut composite = usb::UsbComposite::new(driver, storage, UsbDeviceStrings::default());

    let control = composite
        .take_port(ChannelName::Control)
        .expect("control CDC interface unavailable");
    let telemetry = composite
        .take_port(ChannelName::Telemetry)
        .expect("telemetry CDC interface unavailable");

    let mut device = composite.device;

    join3(
        device.run(),
        run_session_port(control),
        run_session_port(telemetry),
    )
    .await;
    loop {
        core::future::pending::<()>().await;
    }
}

/// Serves one CDC port as a session: DTR up joins, DTR down leaves.
async fn run_session_port<D>(port: usb::CdcAcmHandle<D>) -> !
where
    D: embassy_usb::driver::Driver<'static>,
{
    let usb::CdcAcmHandle {
        channel,
        mut sender,
        mut receiver,
        control,
    } = port;
    let link = port_link(channel);
    let mut ingress = [0u8; usb::MAX_PACKET_SIZE as usize];
    let mut assembler = FrameAssembler::<INBOUND_FRAME_LEN>::new();
    let mut outbound = OutboundCursor::default();

    loop {
        join(receiver.wait_connection(), sender.wait_connection()).await;
        wait_for_dtr(&control, &mut sender).await;
        assembler.clear();
        outbound.reset();
        link.reopen();

        let session = match SESSIONS.join(channel, UsbTransport::new(link), usb::peer_label(channel)) {
            JoinOutcome::Accepted(handle) => {
                TELEMETRY.record(TelemetryEventKind::SessionJoined(channel));
                Some(handle)
            }
            JoinOutcome::Rejected => {
                TELEMETRY.record(TelemetryEventKind::SessionRejected(channel));
                None
            }
        };

        loop {
            let event = select3(
                receiver.read_packet(&mut ingress),
                async {
                    if outbound.is_idle() {
                        outbound.load(link.next_outbound().await);
                    }
                    while let Some(packet) = outbound.next_packet() {
                        if let Err(err) = sender.write_packet(packet).await {
                            return Err(err);
                        }
                        outbound.advance();
                    }
                    Ok(())
                },
                control.control_changed(),
            )
            .await;
            match event {
                Either3::First(Ok(count)) => {
                    if let Some(handle) = session.filter(|_| !link.is_closed()) {
                        accept_bytes(channel, handle, &mut assembler, &ingress[..count]);
                    }
                }
                Either3::First(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: {} interface disabled", channel.label());
                    break;
                }
                Either3::First(Err(_)) => {
                    defmt::warn!("usb: {} read error", channel.label());
                }
                Either3::Second(Ok(())) => {}
                Either3::Second(Err(EndpointError::Disabled)) => {
                    defmt::warn!("usb: {} write disabled", channel.label());
                    break;
                }
                Either3::Second(Err(_)) => {
                    defmt::warn!("usb: {} write error", channel.label());
                    outbound.reset();
                }
                Either3::Third(()) => {
                    if !sender.dtr() {
                        defmt::info!("usb: {} host dropped DTR", channel.label());
                        break;
                    }
                }
            }
        }

        if session.is_some_and(|handle| SESSIONS.leave(handle)) {
            TELEMETRY.record(TelemetryEventKind::SessionLeft(channel));
        }
        link.shut();
    }
}

fn accept_bytes(
    channel: ChannelName,
    handle: SessionHandle,
    assembler: &mut FrameAssembler<INBOUND_FRAME_LEN>,
    bytes: &[u8],
) {
    assembler.feed(bytes, |frame| {
        let routed = match frame {
            Ok(frame) => route_frame(channel, frame, handle, &QUEUE),
            Err(_) => {
                TELEMETRY.record(TelemetryEventKind::FrameDropped(channel));
                return;
            }
        };
        match routed {
            Ok(Routed::Queued(command)) => {
                defmt::debug!("usb: {} queued {}", channel.label(), command.verb.name());
            }
            Ok(Routed::Teleop) => {}
            Err(_) => {
                TELEMETRY.record(TelemetryEventKind::FrameDropped(channel));
            }
        }
    });
}

async fn wait_for_dtr<D>(
    control: &embassy_usb::class::cdc_acm::ControlChanged<'static>,
    sender: &mut embassy_usb::class::cdc_acm::Sender<'static, D>,
) where
    D: embassy_usb::driver::Driver<'static>,
{
    while !sender.dtr() {
        control.control_changed().await;
    }
}
