//! Simulated H-bridge, radio presence line and microphone array.

use std::future::{self, Future};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::task::Poll;
use std::thread;
use std::time::{Duration, Instant};

use rover_core::actuator::{DutyOutputs, MotorId, PinDuties, Polarity, PolarityOutput};
use rover_core::debounce::{
    CooldownScope, CooldownTimers, DebounceConfig, EdgeLines, MICROPHONE_LABELS,
    SensorEventDebouncer, SensorId,
};
use rover_core::dispatch::MotionPause;
use rover_core::serial::{PresenceGate, SerialWrite};

use crate::transcript::{Role, Transcript};

/// Live PWM duties, readable from any thread.
#[derive(Debug, Default)]
pub struct PinBank {
    duties: [AtomicU16; 4],
    shorts: AtomicUsize,
}

impl PinBank {
    /// Duties in legacy pin order.
    pub fn snapshot(&self) -> PinDuties {
        PinDuties(self.duties.each_ref().map(|duty| duty.load(Ordering::Acquire)))
    }

    /// Number of writes that left both polarities of a motor energized.
    pub fn shorts(&self) -> usize {
        self.shorts.load(Ordering::Acquire)
    }
}

const fn pin_index(output: PolarityOutput) -> usize {
    match (output.motor, output.polarity) {
        (MotorId::Left, Polarity::Reverse) => 0,
        (MotorId::Left, Polarity::Forward) => 1,
        (MotorId::Right, Polarity::Reverse) => 2,
        (MotorId::Right, Polarity::Forward) => 3,
    }
}

/// PWM outputs backed by a [`PinBank`].
pub struct SimulatedBridge {
    pins: Arc<PinBank>,
    log: Arc<Transcript>,
}

impl SimulatedBridge {
    pub fn new(pins: Arc<PinBank>, log: Arc<Transcript>) -> Self {
        Self { pins, log }
    }
}

impl DutyOutputs for SimulatedBridge {
    fn set_duty(&mut self, output: PolarityOutput, duty: u16) {
        let index = pin_index(output);
        self.pins.duties[index].store(duty, Ordering::Release);

        let partner = index ^ 1;
        if duty != 0 && self.pins.duties[partner].load(Ordering::Acquire) != 0 {
            self.pins.shorts.fetch_add(1, Ordering::AcqRel);
            self.log.line(
                Role::Control,
                format_args!("SHORT on {:?} motor: {}", output.motor, self.pins.snapshot()),
            );
        }
    }
}

/// Longest stretch the control-loop thread sleeps before polling again.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Sleeps the control-loop thread through motion holds in short slices,
/// yielding between them so teleop frames still land mid-hold.
pub struct ThreadSleep;

impl MotionPause for ThreadSleep {
    fn pause(&mut self, ms: u32) -> impl Future<Output = ()> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(ms));
        future::poll_fn(move |cx| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Poll::Ready(());
            }
            thread::sleep(remaining.min(SLEEP_SLICE));
            cx.waker().wake_by_ref();
            Poll::Pending
        })
    }
}

/// Radio pairing indicator toggled from the console.
#[derive(Clone, Debug, Default)]
pub struct SimPresence(Arc<AtomicBool>);

impl SimPresence {
    pub fn set(&self, present: bool) {
        self.0.store(present, Ordering::Release);
    }
}

impl PresenceGate for SimPresence {
    fn is_present(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Serial link toward the radio, rendered on stdout.
pub struct ConsoleSerial;

impl SerialWrite for ConsoleSerial {
    fn write_bytes(&mut self, bytes: &[u8]) {
        let mut stdout = io::stdout().lock();
        let _ = stdout
            .write_all(b"uart> ")
            .and_then(|()| stdout.write_all(bytes))
            .and_then(|()| stdout.flush());
    }
}

/// Edge interrupt masks for the simulated microphones.
#[derive(Debug)]
pub struct SimLines {
    enabled: [AtomicBool; 4],
}

impl Default for SimLines {
    fn default() -> Self {
        Self {
            enabled: [const { AtomicBool::new(true) }; 4],
        }
    }
}

impl SimLines {
    pub fn is_enabled(&self, sensor: SensorId) -> bool {
        self.enabled
            .get(sensor.index())
            .is_some_and(|line| line.load(Ordering::Acquire))
    }
}

impl EdgeLines for SimLines {
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

/// One-shot timers serviced by a background thread.
pub struct ThreadTimers {
    requests: Sender<(SensorId, Duration)>,
}

impl CooldownTimers for ThreadTimers {
    fn arm(&self, sensor: SensorId, after: Duration) {
        let _ = self.requests.send((sensor, after));
    }
}

pub type Microphones = SensorEventDebouncer<SimLines, ThreadTimers, 4>;

/// Builds the microphone array and starts its timer service.
pub fn microphones(cooldown: Duration, log: Arc<Transcript>) -> Arc<Microphones> {
    let (requests, pending) = mpsc::channel::<(SensorId, Duration)>();
    let array = Arc::new(SensorEventDebouncer::new(
        MICROPHONE_LABELS,
        SimLines::default(),
        ThreadTimers { requests },
        DebounceConfig {
            cooldown,
            scope: CooldownScope::Array,
        },
    ));

    let service = Arc::downgrade(&array);
    thread::spawn(move || {
        for (sensor, after) in pending {
            let service = service.clone();
            let log = log.clone();
            thread::spawn(move || {
                thread::sleep(after);
                if let Some(array) = service.upgrade() {
                    array.on_cooldown_expired(sensor);
                    if array.is_armed(sensor) {
                        log.line(Role::Sensor, "array re-armed");
                    }
                }
            });
        }
    });

    array
}

/// Simulates a sound edge on one line. Masked lines deliver nothing.
pub fn sound(array: &Microphones, sensor: SensorId, log: &Transcript) {
    let label = array.label(sensor).unwrap_or("?");
    if !array.lines().is_enabled(sensor) {
        log.line(Role::Sensor, format_args!("{label}: edge masked"));
        return;
    }
    match array.on_edge(sensor) {
        Some(detection) => log.line(
            Role::Sensor,
            format_args!(
                "first arrival at {} (#{})",
                detection.label, detection.sequence
            ),
        ),
        None => log.line(Role::Sensor, format_args!("{label}: edge suppressed")),
    }
}
