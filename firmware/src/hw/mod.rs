//! Board-side implementations of the core's hardware capabilities.
//!
//! Everything here except [`motors`] builds on the host as well, so the
//! capability glue is unit tested without a board attached.

#![allow(dead_code)]

pub mod motors;

use core::time::Duration as CoreDuration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use heapless::Vec;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use rover_core::actuator::{MotorId, Polarity, PolarityOutput};
use rover_core::debounce::{CooldownTimers, EdgeLines, SensorId};
use rover_core::dispatch::MotionPause;
use rover_core::serial::{PresenceGate, SerialWrite};

/// Number of microphone lines on the board.
pub const MIC_COUNT: usize = 4;

/// Longest status line the control loop echoes to the radio.
pub const ECHO_LINE_LEN: usize = 32;
pub const ECHO_QUEUE_DEPTH: usize = 4;

pub type EchoLine = Vec<u8, ECHO_LINE_LEN>;

/// PWM channel index for a polarity output, in the legacy pin order
/// (left reverse, left forward, right reverse, right forward).
pub const fn pwm_channel_index(output: PolarityOutput) -> usize {
    match (output.motor, output.polarity) {
        (MotorId::Left, Polarity::Reverse) => 0,
        (MotorId::Left, Polarity::Forward) => 1,
        (MotorId::Right, Polarity::Reverse) => 2,
        (MotorId::Right, Polarity::Forward) => 3,
    }
}

/// Rescales a driver duty (`0..=max_duty`) to the timer's compare range.
pub fn scale_duty(duty: u16, max_duty: u16, timer_max: u32) -> u32 {
    if max_duty == 0 {
        return 0;
    }
    let duty = u64::from(duty.min(max_duty));
    let scaled = duty * u64::from(timer_max) / u64::from(max_duty);
    u32::try_from(scaled).unwrap_or(timer_max)
}

/// Suspends the control task for motion holds.
pub struct TimerPause;

impl MotionPause for TimerPause {
    async fn pause(&mut self, ms: u32) {
        Timer::after(Duration::from_millis(u64::from(ms))).await;
    }
}

/// Radio pairing state mirrored from the presence pin by the serial task.
pub struct PresenceFlag {
    present: AtomicBool,
}

impl PresenceFlag {
    pub const fn new() -> Self {
        Self {
            present: AtomicBool::new(false),
        }
    }

    /// Stores the pin level; returns `true` when it changed.
    pub fn update(&self, present: bool) -> bool {
        self.present.swap(present, Ordering::AcqRel) != present
    }

    pub fn is_present(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }
}

impl PresenceGate for &'static PresenceFlag {
    fn is_present(&self) -> bool {
        PresenceFlag::is_present(self)
    }
}

/// Status lines waiting for the radio UART.
///
/// Lines only leave while the radio is paired: losing the peer empties the
/// queue, and a line dequeued after the peer has gone is discarded.
pub struct EchoOutbox {
    lines: Channel<CriticalSectionRawMutex, EchoLine, ECHO_QUEUE_DEPTH>,
    presence: &'static PresenceFlag,
    dropped: AtomicUsize,
}

impl EchoOutbox {
    pub const fn new(presence: &'static PresenceFlag) -> Self {
        Self {
            lines: Channel::new(),
            presence,
            dropped: AtomicUsize::new(0),
        }
    }

    /// Mirrors the presence pin. Returns `true` when the level changed.
    pub fn set_presence(&self, present: bool) -> bool {
        let changed = self.presence.update(present);
        if !present {
            self.lines.clear();
        }
        changed
    }

    /// Waits for the next line to write while the radio is paired.
    pub async fn next_line(&self) -> EchoLine {
        loop {
            let line = self.lines.receive().await;
            if self.presence.is_present() {
                return line;
            }
        }
    }

    pub fn try_next_line(&self) -> Option<EchoLine> {
        while let Ok(line) = self.lines.try_receive() {
            if self.presence.is_present() {
                return Some(line);
            }
        }
        None
    }

    /// Lines dropped because they did not fit, since the last call.
    pub fn take_dropped(&self) -> usize {
        self.dropped.swap(0, Ordering::AcqRel)
    }
}

/// Serial writer used by the control loop's echo. Never blocks; lines that do
/// not fit the outbox are dropped and counted.
pub struct QueuedSerial {
    outbox: &'static EchoOutbox,
}

impl QueuedSerial {
    pub const fn new(outbox: &'static EchoOutbox) -> Self {
        Self { outbox }
    }
}

impl SerialWrite for QueuedSerial {
    fn write_bytes(&mut self, bytes: &[u8]) {
        let sent = EchoLine::from_slice(bytes)
            .ok()
            .is_some_and(|line| self.outbox.lines.try_send(line).is_ok());
        if !sent {
            self.outbox.dropped.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Edge masks for the microphone lines. Sensor tasks only deliver edges for
/// enabled lines.
pub struct MicLines {
    enabled: [AtomicBool; MIC_COUNT],
}

impl MicLines {
    pub const fn new() -> Self {
        Self {
            enabled: [const { AtomicBool::new(true) }; MIC_COUNT],
        }
    }

    pub fn is_enabled(&self, sensor: SensorId) -> bool {
        self.enabled
            .get(sensor.index())
            .is_some_and(|line| line.load(Ordering::Acquire))
    }
}

impl EdgeLines for MicLines {
    fn disable(&self, sensor: SensorId) {
        if let Some(line) = self.enabled.get(sensor.index()) {
            line.store(false, Ordering::Release);
        }
    }

    fn enable(&self, sensor: SensorId) {
        if let Some(line) = self.enabled.get(sensor.index()) {
            line.store(true, Ordering::Release);
        }
    }
}

/// One-shot cooldown requests, one signal per line. The line's sensor task
/// waits on its signal, sleeps and reports expiry.
pub struct MicTimers {
    requests: [Signal<CriticalSectionRawMutex, Duration>; MIC_COUNT],
}

impl MicTimers {
    pub const fn new() -> Self {
        Self {
            requests: [const { Signal::new() }; MIC_COUNT],
        }
    }

    /// Waits for the next cooldown request on `sensor`.
    pub async fn requested(&self, sensor: SensorId) -> Duration {
        match self.requests.get(sensor.index()) {
            Some(request) => request.wait().await,
            None => core::future::pending().await,
        }
    }

    pub fn try_requested(&self, sensor: SensorId) -> Option<Duration> {
        self.requests.get(sensor.index())?.try_take()
    }
}

impl CooldownTimers for MicTimers {
    fn arm(&self, sensor: SensorId, after: CoreDuration) {
        let micros = u64::try_from(after.as_micros()).unwrap_or(u64::MAX);
        if let Some(request) = self.requests.get(sensor.index()) {
            request.signal(Duration::from_micros(micros));
        }
    }
}
