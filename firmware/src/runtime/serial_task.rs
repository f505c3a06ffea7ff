use embassy_futures::select::{Either3, select3};
use embassy_stm32 as hal;
use embassy_stm32::Peri;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::usart::{BufferedUart, Config as UartConfig, DataBits, Parity, StopBits};
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use rover_core::serial::SerialBridge;
use static_cell::StaticCell;

use super::{ECHO, PRESENCE, QUEUE, TELEMETRY};
use crate::telemetry::TelemetryEventKind;

const RADIO_UART_BAUD: u32 = 115_200;
const RADIO_UART_BUFFER_SIZE: usize = 64;

static UART_TX_BUFFER: StaticCell<[u8; RADIO_UART_BUFFER_SIZE]> = StaticCell::new();
static UART_RX_BUFFER: StaticCell<[u8; RADIO_UART_BUFFER_SIZE]> = StaticCell::new();

embassy_stm32::bind_interrupts!(struct UartIrqs {
    USART3_4_5_6_LPUART1 => embassy_stm32::usart::BufferedInterruptHandler<hal::peripherals::USART5>;
});

/// Radio link: drive keys in, status echo out, gated by the pairing pin.
#[embassy_executor::task]
pub async fn run(
    usart: Peri<'static, hal::peripherals::USART5>,
    tx_pin: Peri<'static, hal::peripherals::PB0>,
    rx_pin: Peri<'static, hal::peripherals::PB1>,
    mut presence_pin: ExtiInput<'static>,
) -> ! {
    let mut config = UartConfig::default();
    config.baudrate = RADIO_UART_BAUD;
    config.data_bits = DataBits::DataBits8;
    config.stop_bits = StopBits::STOP1;
    config.parity = Parity::ParityNone;

    let uart = BufferedUart::new(
        usart,
        rx_pin,
        tx_pin,
        UART_TX_BUFFER.init([0; RADIO_UART_BUFFER_SIZE]),
        UART_RX_BUFFER.init([0; RADIO_UART_BUFFER_SIZE]),
        UartIrqs,
        config,
    )
    .expect("failed to initialize radio UART");
    let (mut uart_tx, mut uart_rx) = uart.split();

    let bridge = SerialBridge::new(&PRESENCE);
    let mut ingress = [0u8; RADIO_UART_BUFFER_SIZE];
    update_presence(presence_pin.is_high());

    loop {
        match select3(
            uart_rx.read(&mut ingress),
            ECHO.next_line(),
            presence_pin.wait_for_any_edge(),
        )
        .await
        {
            Either3::First(Ok(count)) => {
                let report = bridge.feed(&ingress[..count], &QUEUE);
                if report.dropped > 0 {
                    defmt::warn!("serial: {} key(s) dropped, queue full", report.dropped);
                }
            }
            Either3::First(Err(_)) => {
                defmt::warn!("serial: UART read error");
                Timer::after(Duration::from_millis(5)).await;
            }
            Either3::Second(line) => {
                if uart_tx.write_all(&line).await.is_err() || uart_tx.flush().await.is_err() {
                    defmt::warn!("serial: UART write error");
                }
            }
            Either3::Third(()) => update_presence(presence_pin.is_high()),
        }
    }
}

fn update_presence(present: bool) {
    if ECHO.set_presence(present) {
        TELEMETRY.record(TelemetryEventKind::PresenceChanged(present));
    }
}
