//! Dual-CDC USB composite device carrying the two session channels.
//!
//! CDC0 is the control channel and CDC1 the telemetry (teleop) channel. A
//! host joins a channel by opening the port and asserting DTR, then exchanges
//! newline-terminated JSON frames. Outbound frames are queued through a
//! [`PortLink`] so the session registry can send without awaiting USB.

#![allow(dead_code)]

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use heapless::Vec;
use portable_atomic::{AtomicBool, Ordering};
use rover_core::protocol::REPLY_CAPACITY;
use rover_core::session::{ChannelName, Transport, TransportError};

pub const MAX_PACKET_SIZE: u16 = 64;

/// Longest inbound frame accepted from a host, newline excluded.
pub const INBOUND_FRAME_LEN: usize = 256;
/// Longest outbound frame, newline included.
pub const OUTBOUND_FRAME_LEN: usize = REPLY_CAPACITY + 2;
pub const OUTBOUND_QUEUE_DEPTH: usize = 4;

pub type OutboundFrame = Vec<u8, OUTBOUND_FRAME_LEN>;

#[cfg(target_os = "none")]
const CONTROL_BUFFER_LEN: usize = 64;
#[cfg(target_os = "none")]
const CONFIG_DESCRIPTOR_LEN: usize = 256;
#[cfg(target_os = "none")]
const BOS_DESCRIPTOR_LEN: usize = 256;
#[cfg(target_os = "none")]
const MSOS_DESCRIPTOR_LEN: usize = 256;

/// Peer address reported to the registry for a CDC port.
pub const fn peer_label(channel: ChannelName) -> &'static str {
    match channel {
        ChannelName::Control => "usb-cdc0",
        ChannelName::Telemetry => "usb-cdc1",
    }
}

/// User-visible strings advertised in the USB descriptors.
#[derive(Clone, Copy, Debug)]
pub struct UsbDeviceStrings {
    pub manufacturer: &'static str,
    pub product: &'static str,
    pub serial_number: Option<&'static str>,
}

impl Default for UsbDeviceStrings {
    fn default() -> Self {
        Self {
            manufacturer: "Rover",
            product: "Rover Motor Controller",
            serial_number: None,
        }
    }
}

/// Outbound queue and close flag shared by a port task and the session
/// transport installed for it.
pub struct PortLink {
    outbound: Channel<CriticalSectionRawMutex, OutboundFrame, OUTBOUND_QUEUE_DEPTH>,
    closed: AtomicBool,
}

impl PortLink {
    pub const fn new() -> Self {
        Self {
            outbound: Channel::new(),
            closed: AtomicBool::new(true),
        }
    }

    /// Drops stale frames and opens the link for a new host connection.
    pub fn reopen(&self) {
        while self.outbound.try_receive().is_ok() {}
        self.closed.store(false, Ordering::Release);
    }

    /// Closes the link once the host has gone and drops unsent frames.
    pub fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        while self.outbound.try_receive().is_ok() {}
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits for the next frame to write to the host.
    pub async fn next_outbound(&self) -> OutboundFrame {
        self.outbound.receive().await
    }
}

impl Default for PortLink {
    fn default() -> Self {
        Self::new()
    }
}

/// Session transport over a CDC port.
pub struct UsbTransport {
    link: &'static PortLink,
}

impl UsbTransport {
    pub const fn new(link: &'static PortLink) -> Self {
        Self { link }
    }
}

impl Transport for UsbTransport {
    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        if self.link.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut frame = OutboundFrame::new();
        if frame.extend_from_slice(text.as_bytes()).is_err() || frame.push(b'\n').is_err() {
            return Err(TransportError::Full);
        }
        self.link
            .outbound
            .try_send(frame)
            .map_err(|_| TransportError::Full)
    }

    fn close(&self) {
        self.link.closed.store(true, Ordering::Release);
    }
}

/// Frame being written to the host, packet by packet.
///
/// The write future can be cancelled between packets, so progress lives here
/// and a resumed write continues with the first unsent packet.
#[derive(Default)]
pub struct OutboundCursor {
    frame: Option<OutboundFrame>,
    sent: usize,
}

impl OutboundCursor {
    pub fn is_idle(&self) -> bool {
        self.frame.is_none()
    }

    pub fn load(&mut self, frame: OutboundFrame) {
        self.frame = Some(frame);
        self.sent = 0;
    }

    pub fn reset(&mut self) {
        self.frame = None;
        self.sent = 0;
    }

    /// Next unsent packet, or `None` once the frame is fully written.
    pub fn next_packet(&self) -> Option<&[u8]> {
        let rest = self.frame.as_ref()?.get(self.sent..)?;
        if rest.is_empty() {
            return None;
        }
        Some(&rest[..rest.len().min(usize::from(MAX_PACKET_SIZE))])
    }

    /// Marks the packet returned by [`Self::next_packet`] as written.
    pub fn advance(&mut self) {
        let Some(frame) = self.frame.as_ref() else {
            return;
        };
        self.sent = (self.sent + usize::from(MAX_PACKET_SIZE)).min(frame.len());
        if self.sent == frame.len() {
            self.reset();
        }
    }
}

/// Why an inbound line was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    Overflow,
    NotUtf8,
}

/// Splits a CDC byte stream into newline-terminated frames.
pub struct FrameAssembler<const N: usize> {
    line: Vec<u8, N>,
    overflowed: bool,
}

impl<const N: usize> FrameAssembler<N> {
    pub const fn new() -> Self {
        Self {
            line: Vec::new(),
            overflowed: false,
        }
    }

    pub fn clear(&mut self) {
        self.line.clear();
        self.overflowed = false;
    }

    /// Feeds received bytes, calling `on_frame` once per completed line.
    /// Carriage returns and blank lines are skipped.
    pub fn feed(&mut self, bytes: &[u8], mut on_frame: impl FnMut(Result<&str, FrameError>)) {
        for &byte in bytes {
            match byte {
                b'\n' => {
                    if self.overflowed {
                        on_frame(Err(FrameError::Overflow));
                    } else if !self.line.is_empty() {
                        on_frame(core::str::from_utf8(&self.line).map_err(|_| FrameError::NotUtf8));
                    }
                    self.clear();
                }
                b'\r' => {}
                _ if self.overflowed => {}
                _ => {
                    if self.line.push(byte).is_err() {
                        self.overflowed = true;
                    }
                }
            }
        }
    }
}

impl<const N: usize> Default for FrameAssembler<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Backing storage for the Embassy USB builder and CDC ACM classes.
#[cfg(target_os = "none")]
pub struct UsbDeviceStorage {
    control_buf: [u8; CONTROL_BUFFER_LEN],
    config_descriptor: [u8; CONFIG_DESCRIPTOR_LEN],
    bos_descriptor: [u8; BOS_DESCRIPTOR_LEN],
    msos_descriptor: [u8; MSOS_DESCRIPTOR_LEN],
    control_state: embassy_usb::class::cdc_acm::State<'static>,
    telemetry_state: embassy_usb::class::cdc_acm::State<'static>,
}

#[cfg(target_os = "none")]
impl UsbDeviceStorage {
    pub fn new() -> Self {
        Self {
            control_buf: [0; CONTROL_BUFFER_LEN],
            config_descriptor: [0; CONFIG_DESCRIPTOR_LEN],
            bos_descriptor: [0; BOS_DESCRIPTOR_LEN],
            msos_descriptor: [0; MSOS_DESCRIPTOR_LEN],
            control_state: embassy_usb::class::cdc_acm::State::new(),
            telemetry_state: embassy_usb::class::cdc_acm::State::new(),
        }
    }
}

/// Split handles for a CDC ACM interface.
#[cfg(target_os = "none")]
pub struct CdcAcmHandle<D: embassy_usb::driver::Driver<'static>> {
    pub channel: ChannelName,
    pub sender: embassy_usb::class::cdc_acm::Sender<'static, D>,
    pub receiver: embassy_usb::class::cdc_acm::Receiver<'static, D>,
    pub control: embassy_usb::class::cdc_acm::ControlChanged<'static>,
}

/// Owns the two CDC ACM interfaces and the resulting USB device.
#[cfg(target_os = "none")]
pub struct UsbComposite<D>
where
    D: embassy_usb::driver::Driver<'static>,
{
    pub device: embassy_usb::UsbDevice<'static, D>,
    control: Option<CdcAcmHandle<D>>,
    telemetry: Option<CdcAcmHandle<D>>,
}

#[cfg(target_os = "none")]
impl<D> UsbComposite<D>
where
    D: embassy_usb::driver::Driver<'static>,
{
    pub fn new(
        driver: D,
        storage: &'static mut UsbDeviceStorage,
        strings: UsbDeviceStrings,
    ) -> Self {
        let mut config = embassy_usb::Config::new(0x1209, 0x0001);
        config.manufacturer = Some(strings.manufacturer);
        config.product = Some(strings.product);
        config.serial_number = strings.serial_number;
        config.max_packet_size_0 = 64;
        config.max_power = 100;
        config.device_class = 0xEF;
        config.device_sub_class = 0x02;
        config.device_protocol = 0x01;
        config.composite_with_iads = true;

        let mut builder = embassy_usb::Builder::new(
            driver,
            config,
            &mut storage.config_descriptor,
            &mut storage.bos_descriptor,
            &mut storage.msos_descriptor,
            &mut storage.control_buf,
        );

        let control = embassy_usb::class::cdc_acm::CdcAcmClass::new(
            &mut builder,
            &mut storage.control_state,
            MAX_PACKET_SIZE,
        );
        let telemetry = embassy_usb::class::cdc_acm::CdcAcmClass::new(
            &mut builder,
            &mut storage.telemetry_state,
            MAX_PACKET_SIZE,
        );

        let (control_tx, control_rx, control_ctrl) = control.split_with_control();
        let (telemetry_tx, telemetry_rx, telemetry_ctrl) = telemetry.split_with_control();

        let device = builder.build();

        Self {
            device,
            control: Some(CdcAcmHandle {
                channel: ChannelName::Control,
                sender: control_tx,
                receiver: control_rx,
                control: control_ctrl,
            }),
            telemetry: Some(CdcAcmHandle {
                channel: ChannelName::Telemetry,
                sender: telemetry_tx,
                receiver: telemetry_rx,
                control: telemetry_ctrl,
            }),
        }
    }

    /// Takes ownership of the CDC interface serving `channel`.
    pub fn take_port(&mut self, channel: ChannelName) -> Option<CdcAcmHandle<D>> {
        match channel {
            ChannelName::Control => self.control.take(),
            ChannelName::Telemetry => self.telemetry.take(),
        }
    }
}
