use std::future::Future;
use std::sync::{Arc, Mutex};

use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use rover_core::actuator::{ActuatorDriver, DutyOutputs, MotorId, Polarity, PolarityOutput};
use rover_core::dispatch::{
    Command, CommandDispatcher, CommandQueue, DriveConfig, MotionPause, QueueOrder,
};
use rover_core::protocol::{decode_control, decode_motor_frame};
use rover_core::serial::{PresenceEcho, PresenceGate, SerialBridge, SerialWrite};
use rover_core::session::{ChannelName, SessionRegistry, Transport, TransportError};

/// Interleaved record of hardware writes, replies and serial output.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Duty(MotorId, Polarity, u16),
    Reply(String),
    Serial(String),
}

type Log = Arc<Mutex<Vec<Event>>>;

#[derive(Clone)]
struct LoggedOutputs(Log);

impl DutyOutputs for LoggedOutputs {
    fn set_duty(&mut self, output: PolarityOutput, duty: u16) {
        self.0
            .lock()
            .unwrap()
            .push(Event::Duty(output.motor, output.polarity, duty));
    }
}

#[derive(Clone)]
struct LoggedTransport(Log);

impl Transport for LoggedTransport {
    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.0.lock().unwrap().push(Event::Reply(text.to_owned()));
        Ok(())
    }

    fn close(&self) {}
}

#[derive(Clone)]
struct LoggedSerial(Log);

impl SerialWrite for LoggedSerial {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.0
            .lock()
            .unwrap()
            .push(Event::Serial(String::from_utf8_lossy(bytes).into_owned()));
    }
}

#[derive(Clone, Copy)]
struct Presence(bool);

impl PresenceGate for Presence {
    fn is_present(&self) -> bool {
        self.0
    }
}

struct Instant;

impl MotionPause for Instant {
    fn pause(&mut self, _ms: u32) -> impl Future<Output = ()> {
        std::future::ready(())
    }
}

type Registry = SessionRegistry<CriticalSectionRawMutex, LoggedTransport>;
type Queue = CommandQueue<CriticalSectionRawMutex, 16>;

fn rig(
    log: &Log,
    presence: bool,
) -> CommandDispatcher<LoggedOutputs, Instant, PresenceEcho<Presence, LoggedSerial>> {
    let dispatcher = CommandDispatcher::new(
        ActuatorDriver::new(LoggedOutputs(log.clone())),
        Instant,
        PresenceEcho::new(Presence(presence), LoggedSerial(log.clone())),
        DriveConfig::default(),
    );
    log.lock().unwrap().clear();
    dispatcher
}

#[test]
fn set_motor_powers_updates_hardware_before_replying() {
    let log = Log::default();
    let registry = Registry::new();
    let queue = Queue::new(QueueOrder::Fifo);
    let mut dispatcher = rig(&log, false);

    let session = registry
        .join(ChannelName::Control, LoggedTransport(log.clone()), "192.168.4.2:51000")
        .handle()
        .expect("control slot free");

    let request = decode_control(r#"{"cmd":"SetMotorPowers","param":-500}"#).unwrap();
    queue
        .submit(Command::from_request(request, Some(session)))
        .unwrap();

    let report = block_on(dispatcher.drain_and_execute(&queue, &registry));
    assert_eq!(report.executed, 1);
    assert_eq!(report.replies_sent, 1);

    let status = dispatcher.driver().status();
    assert_eq!((status.m1, status.m2), (-500, -500));

    let events = log.lock().unwrap().clone();
    let reply_at = events
        .iter()
        .position(|e| *e == Event::Reply(r#"{"result": "ok"}"#.to_owned()))
        .expect("reply sent");
    let last_duty = events
        .iter()
        .rposition(|e| matches!(e, Event::Duty(..)))
        .expect("duties written");
    assert!(last_duty < reply_at, "side effect precedes the reply: {events:?}");
    assert!(events.contains(&Event::Duty(MotorId::Left, Polarity::Reverse, 500)));
    assert!(events.contains(&Event::Duty(MotorId::Right, Polarity::Reverse, 500)));
}

#[test]
fn telemetry_frame_overrides_before_queued_stop() {
    let log = Log::default();
    let registry = Registry::new();
    let queue = Queue::new(QueueOrder::Fifo);
    let mut dispatcher = rig(&log, false);

    queue
        .submit(Command::from_request(
            decode_control(r#"{"cmd":"stop"}"#).unwrap(),
            None,
        ))
        .unwrap();
    queue.post_teleop(decode_motor_frame(r#"{"m1": 800.4, "m2": 200}"#).unwrap());

    let report = block_on(dispatcher.drain_and_execute(&queue, &registry));
    assert_eq!(report.teleop_applied, 1);
    assert_eq!(report.executed, 1);

    let events = log.lock().unwrap().clone();
    assert_eq!(
        events.first(),
        Some(&Event::Duty(MotorId::Left, Polarity::Reverse, 0)),
        "teleop applies first"
    );
    assert!(events.contains(&Event::Duty(MotorId::Left, Polarity::Forward, 800)));
    let status = dispatcher.driver().status();
    assert_eq!((status.m1, status.m2), (0, 0), "queued stop runs after");
}

#[test]
fn serial_keys_drive_and_echo_only_while_present() {
    let log = Log::default();
    let registry = Registry::new();
    let queue = Queue::new(QueueOrder::Fifo);

    let absent = SerialBridge::new(Presence(false));
    assert_eq!(absent.feed(b"w", &queue).ignored, 1);
    assert!(queue.is_empty());

    let present = SerialBridge::new(Presence(true));
    assert_eq!(present.feed(b"w\n", &queue).submitted, 1);

    let mut dispatcher = rig(&log, true);
    block_on(dispatcher.drain_and_execute(&queue, &registry));

    let status = dispatcher.driver().status();
    assert_eq!((status.m1, status.m2), (1000, 1000), "keys drive continuously");
    let serial: Vec<_> = log
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            Event::Serial(line) => Some(line.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(serial, ["(0, 1000, 0, 1000)\n"]);

    let mut quiet = rig(&log, false);
    present.feed(b"s", &queue);
    block_on(quiet.drain_and_execute(&queue, &registry));
    assert!(
        !log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::Serial(_))),
        "echo skipped while presence is low"
    );
}
