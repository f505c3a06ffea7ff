//! Command serialization and the control loop.
//!
//! Both command sources, the network control channel and the serial bridge,
//! submit [`Command`]s into one [`CommandQueue`]. A single
//! [`CommandDispatcher`] owns the [`ActuatorDriver`], drains the queue in
//! policy order and executes each command to completion before taking the
//! next, so motor state only ever changes from one context. Telemetry frames
//! bypass the queue through the teleop mailbox and are applied by the same
//! loop ahead of queued work and while a command pauses. A frame applied
//! during a motion hold takes over the motors: the hold runs out but the
//! trailing stop is skipped.

mod queue;
mod route;
mod verb;

use core::fmt::Write as _;
use core::future::Future;
use core::pin::pin;

use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::{NoopRawMutex, RawMutex};
use heapless::String;

pub use queue::{CommandQueue, QueueOrder, SubmitError, TeleopMailbox};
pub use route::{RouteError, Routed, route_frame};
pub use verb::{Hold, Motion, ParamKind, Verb};

use crate::actuator::{ActuatorDriver, DutyOutputs, MotorStatus, PinDuties};
use crate::protocol::{self, ControlRequest, MotorFrame};
use crate::session::{SessionHandle, SessionRegistry, Transport};

/// Power level applied by motion verbs until changed.
pub const DEFAULT_POWER: u16 = 1000;
/// Hold for forward and backward pulses.
pub const DEFAULT_MOTION_HOLD_MS: u32 = 500;
/// Hold for rotations and turns.
pub const DEFAULT_PIVOT_HOLD_MS: u32 = 200;
/// Pause for `Wait` without a parameter.
pub const DEFAULT_WAIT_MS: u32 = 500;
/// Longest single pause; longer holds and waits are cut to this.
pub const MAX_PAUSE_MS: u32 = 60_000;
/// Queue capacity used by the front-ends.
pub const QUEUE_DEPTH: usize = 32;

/// Capacity of a command's result text before JSON encoding.
pub const OUTCOME_CAPACITY: usize = 48;

/// Result text produced by one executed command.
pub type Outcome = String<OUTCOME_CAPACITY>;

/// Drive defaults for motion verbs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DriveConfig {
    pub power: u16,
    pub motion_hold_ms: u32,
    pub pivot_hold_ms: u32,
    pub wait_ms: u32,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            power: DEFAULT_POWER,
            motion_hold_ms: DEFAULT_MOTION_HOLD_MS,
            pivot_hold_ms: DEFAULT_PIVOT_HOLD_MS,
            wait_ms: DEFAULT_WAIT_MS,
        }
    }
}

/// Dispatcher configuration.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DispatchConfig {
    pub order: QueueOrder,
    pub drive: DriveConfig,
}

/// A request to the control loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub verb: Verb,
    pub param: Option<i32>,
    /// Session that receives the `{"result": ..}` reply, if any.
    pub reply_to: Option<SessionHandle>,
}

impl Command {
    pub const fn new(verb: Verb, param: Option<i32>) -> Self {
        Self {
            verb,
            param,
            reply_to: None,
        }
    }

    #[must_use]
    pub const fn reply_to(mut self, handle: SessionHandle) -> Self {
        self.reply_to = Some(handle);
        self
    }

    pub const fn from_request(request: ControlRequest, reply_to: Option<SessionHandle>) -> Self {
        Self {
            verb: request.verb,
            param: request.param,
            reply_to,
        }
    }
}

/// Waits out motion holds and `Wait` verbs.
pub trait MotionPause {
    fn pause(&mut self, ms: u32) -> impl Future<Output = ()>;
}

/// Notified after every change of the motor duties.
pub trait DutyObserver {
    fn duty_changed(&mut self, pins: PinDuties, status: MotorStatus);
}

/// Observer that ignores duty changes.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopObserver;

impl DutyObserver for NoopObserver {
    fn duty_changed(&mut self, _pins: PinDuties, _status: MotorStatus) {}
}

/// Summary of one drain pass.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DrainReport {
    pub executed: usize,
    pub teleop_applied: usize,
    pub replies_sent: usize,
    pub replies_discarded: usize,
}

impl DrainReport {
    pub const fn is_idle(&self) -> bool {
        self.executed == 0 && self.teleop_applied == 0
    }
}

/// Sole owner of the actuator driver.
pub struct CommandDispatcher<O, P, D = NoopObserver> {
    driver: ActuatorDriver<O>,
    pause: P,
    observer: D,
    drive: DriveConfig,
    power: u16,
    steered: usize,
}

impl<O, P, D> CommandDispatcher<O, P, D>
where
    O: DutyOutputs,
    P: MotionPause,
    D: DutyObserver,
{
    pub fn new(driver: ActuatorDriver<O>, pause: P, observer: D, drive: DriveConfig) -> Self {
        let power = drive.power.min(driver.max_duty());
        Self {
            driver,
            pause,
            observer,
            drive,
            power,
            steered: 0,
        }
    }

    pub fn driver(&self) -> &ActuatorDriver<O> {
        &self.driver
    }

    pub const fn power(&self) -> u16 {
        self.power
    }

    pub fn observer(&self) -> &D {
        &self.observer
    }

    pub fn into_parts(self) -> (ActuatorDriver<O>, P, D) {
        (self.driver, self.pause, self.observer)
    }

    /// Executes queued commands until the queue is empty.
    ///
    /// A pending teleop frame is applied before each dequeue and whenever
    /// one arrives while a command pauses. Replies are sent after the
    /// command's side effect; a reply whose session has gone is counted and
    /// dropped.
    pub async fn drain_and_execute<MQ, MS, T, const N: usize>(
        &mut self,
        queue: &CommandQueue<MQ, N>,
        sessions: &SessionRegistry<MS, T>,
    ) -> DrainReport
    where
        MQ: RawMutex,
        MS: RawMutex,
        T: Transport,
    {
        let mut report = DrainReport::default();
        loop {
            if let Some(frame) = queue.teleop().take() {
                self.apply_teleop(frame);
                report.teleop_applied += 1;
            }

            let Some(command) = queue.pop() else {
                break;
            };

            let outcome = self.execute_steered(&command, queue.teleop()).await;
            report.executed += 1;
            report.teleop_applied += core::mem::take(&mut self.steered);

            if let Some(handle) = command.reply_to {
                match sessions.send(handle, &protocol::encode_result(&outcome)) {
                    Ok(()) => report.replies_sent += 1,
                    Err(_) => report.replies_discarded += 1,
                }
            }
        }
        report
    }

    /// Waits on the queue doorbell and drains forever.
    pub async fn run<MQ, MS, T, const N: usize>(
        &mut self,
        queue: &CommandQueue<MQ, N>,
        sessions: &SessionRegistry<MS, T>,
        mut on_report: impl FnMut(DrainReport),
    ) -> !
    where
        MQ: RawMutex,
        MS: RawMutex,
        T: Transport,
    {
        loop {
            queue.wait().await;
            let report = self.drain_and_execute(queue, sessions).await;
            if !report.is_idle() {
                on_report(report);
            }
        }
    }

    /// Applies a telemetry frame directly to both motors.
    pub fn apply_teleop(&mut self, frame: MotorFrame) {
        self.update(|driver| steer(driver, frame));
    }

    /// Runs one command to completion and returns its result text.
    pub async fn execute(&mut self, command: &Command) -> Outcome {
        self.execute_steered(command, &TeleopMailbox::<NoopRawMutex>::new())
            .await
    }

    /// Runs one command, applying frames posted to `teleop` while it pauses.
    pub async fn execute_steered<MT: RawMutex>(
        &mut self,
        command: &Command,
        teleop: &TeleopMailbox<MT>,
    ) -> Outcome {
        let mut outcome = Outcome::new();
        let param = command.param;

        match command.verb {
            Verb::Stop => self.update(ActuatorDriver::stop_all),
            Verb::Forward => self.pulse(Motion::Forward, param, teleop).await,
            Verb::Backward => self.pulse(Motion::Backward, param, teleop).await,
            Verb::RotateLeft => self.pulse(Motion::RotateLeft, param, teleop).await,
            Verb::RotateRight => self.pulse(Motion::RotateRight, param, teleop).await,
            Verb::TurnLeft => self.pulse(Motion::TurnLeft, param, teleop).await,
            Verb::TurnRight => self.pulse(Motion::TurnRight, param, teleop).await,
            Verb::Wait => {
                let ms = param.map_or(self.drive.wait_ms, |ms| u32::try_from(ms).unwrap_or(0));
                self.hold(ms, teleop).await;
            }
            Verb::Wait1s => {
                self.hold(1_000, teleop).await;
            }
            Verb::Wait5s => {
                self.hold(5_000, teleop).await;
            }
            Verb::SetGlobalPower => match param {
                Some(level) => self.power = self.clamp_power(level),
                None => {
                    let _ = outcome.write_str("missing parameter");
                    return outcome;
                }
            },
            Verb::GetGlobalPower => {
                let _ = write!(outcome, "{}", self.power);
                return outcome;
            }
            Verb::SetMotorPowers => match param {
                Some(power) => self.update(|driver| driver.set_motor_powers(power, power)),
                None => {
                    let _ = outcome.write_str("missing parameter");
                    return outcome;
                }
            },
            Verb::GetPinsStatus => {
                let _ = write!(outcome, "{}", self.driver.pins());
                return outcome;
            }
            Verb::GetStatus => {
                let _ = write!(outcome, "{}", self.driver.status());
                return outcome;
            }
        }

        let _ = outcome.write_str("ok");
        outcome
    }

    async fn pulse<MT: RawMutex>(
        &mut self,
        motion: Motion,
        param: Option<i32>,
        teleop: &TeleopMailbox<MT>,
    ) {
        let default_hold = if motion.is_pivot() {
            self.drive.pivot_hold_ms
        } else {
            self.drive.motion_hold_ms
        };
        let (m1, m2) = motion.powers(i32::from(self.power));
        self.update(|driver| driver.set_motor_powers(m1, m2));

        let Hold::For(ms) = Hold::from_param(param, default_hold) else {
            return;
        };
        if !self.hold(ms, teleop).await {
            self.update(ActuatorDriver::stop_all);
        }
    }

    /// Pauses for `ms`, capped at [`MAX_PAUSE_MS`], applying teleop frames as
    /// they arrive. Returns `true` if any frame was applied.
    async fn hold<MT: RawMutex>(&mut self, ms: u32, teleop: &TeleopMailbox<MT>) -> bool {
        let mut steered = false;
        let mut pause = pin!(self.pause.pause(ms.min(MAX_PAUSE_MS)));
        loop {
            match select(pause.as_mut(), teleop.wait()).await {
                Either::First(()) => return steered,
                Either::Second(()) => {
                    let Some(frame) = teleop.take() else {
                        continue;
                    };
                    change_duties(&mut self.driver, &mut self.observer, |driver| {
                        steer(driver, frame);
                    });
                    self.steered += 1;
                    steered = true;
                }
            }
        }
    }

    fn clamp_power(&self, level: i32) -> u16 {
        let max = self.driver.max_duty();
        u16::try_from(level.clamp(0, i32::from(max))).unwrap_or(max)
    }

    fn update(&mut self, change: impl FnOnce(&mut ActuatorDriver<O>)) {
        change_duties(&mut self.driver, &mut self.observer, change);
    }
}

fn steer<O: DutyOutputs>(driver: &mut ActuatorDriver<O>, frame: MotorFrame) {
    for intent in frame.intents() {
        driver.apply(intent);
    }
}

fn change_duties<O: DutyOutputs, D: DutyObserver>(
    driver: &mut ActuatorDriver<O>,
    observer: &mut D,
    change: impl FnOnce(&mut ActuatorDriver<O>),
) {
    let before = driver.pins();
    change(driver);
    let after = driver.pins();
    if before != after {
        observer.duty_changed(after, driver.status());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{MotorId, PolarityOutput};
    use crate::session::{ChannelName, TransportError};
    use std::cell::RefCell;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use core::task::Poll;
    use std::rc::Rc;
    use std::string::String as StdString;
    use std::vec::Vec;

    #[derive(Default)]
    struct NullOutputs;

    impl DutyOutputs for NullOutputs {
        fn set_duty(&mut self, _output: PolarityOutput, _duty: u16) {}
    }

    #[derive(Default)]
    struct RecordingPause {
        pauses: Vec<u32>,
    }

    impl MotionPause for RecordingPause {
        fn pause(&mut self, ms: u32) -> impl Future<Output = ()> {
            self.pauses.push(ms);
            core::future::ready(())
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        changes: Vec<(PinDuties, MotorStatus)>,
    }

    impl DutyObserver for RecordingObserver {
        fn duty_changed(&mut self, pins: PinDuties, status: MotorStatus) {
            self.changes.push((pins, status));
        }
    }

    #[derive(Clone, Default)]
    struct Inbox {
        frames: Rc<RefCell<Vec<StdString>>>,
    }

    impl Transport for Inbox {
        fn send_text(&self, text: &str) -> Result<(), TransportError> {
            self.frames.borrow_mut().push(StdString::from(text));
            Ok(())
        }

        fn close(&self) {}
    }

    type Dispatcher = CommandDispatcher<NullOutputs, RecordingPause, RecordingObserver>;
    type Queue = CommandQueue<NoopRawMutex, 8>;
    type Registry = SessionRegistry<NoopRawMutex, Inbox>;

    fn dispatcher() -> Dispatcher {
        CommandDispatcher::new(
            ActuatorDriver::new(NullOutputs),
            RecordingPause::default(),
            RecordingObserver::default(),
            DriveConfig::default(),
        )
    }

    #[test]
    fn forward_pulse_drives_then_stops() {
        let mut dispatcher = dispatcher();
        let outcome = block_on(dispatcher.execute(&Command::new(Verb::Forward, None)));

        assert_eq!(outcome.as_str(), "ok");
        assert_eq!(dispatcher.pause.pauses, [DEFAULT_MOTION_HOLD_MS]);
        let statuses: Vec<_> = dispatcher.observer.changes.iter().map(|c| c.1).collect();
        assert_eq!(
            statuses,
            [
                MotorStatus { m1: 1000, m2: 1000 },
                MotorStatus { m1: 0, m2: 0 }
            ]
        );
    }

    #[test]
    fn continuous_hold_leaves_motors_running() {
        let mut dispatcher = dispatcher();
        block_on(dispatcher.execute(&Command::new(Verb::RotateRight, Some(-1))));

        assert!(dispatcher.pause.pauses.is_empty());
        assert_eq!(
            dispatcher.driver().status(),
            MotorStatus { m1: 1000, m2: -1000 }
        );
    }

    #[test]
    fn pivots_use_short_default_hold() {
        let mut dispatcher = dispatcher();
        block_on(dispatcher.execute(&Command::new(Verb::TurnLeft, None)));
        block_on(dispatcher.execute(&Command::new(Verb::Wait, None)));
        block_on(dispatcher.execute(&Command::new(Verb::Wait5s, None)));
        assert_eq!(
            dispatcher.pause.pauses,
            [DEFAULT_PIVOT_HOLD_MS, DEFAULT_WAIT_MS, 5_000]
        );
    }

    #[test]
    fn global_power_is_clamped_and_reported() {
        let mut dispatcher = dispatcher();
        block_on(dispatcher.execute(&Command::new(Verb::SetGlobalPower, Some(5000))));
        assert_eq!(dispatcher.power(), 1023);

        block_on(dispatcher.execute(&Command::new(Verb::SetGlobalPower, Some(400))));
        let reply = block_on(dispatcher.execute(&Command::new(Verb::GetGlobalPower, None)));
        assert_eq!(reply.as_str(), "400");

        block_on(dispatcher.execute(&Command::new(Verb::Backward, Some(-1))));
        assert_eq!(dispatcher.driver().status(), MotorStatus { m1: -400, m2: -400 });
    }

    #[test]
    fn status_queries_format_legacy_text() {
        let mut dispatcher = dispatcher();
        block_on(dispatcher.execute(&Command::new(Verb::SetMotorPowers, Some(-500))));

        let pins = block_on(dispatcher.execute(&Command::new(Verb::GetPinsStatus, None)));
        assert_eq!(pins.as_str(), "(500, 0, 500, 0)");

        let status = block_on(dispatcher.execute(&Command::new(Verb::GetStatus, None)));
        assert_eq!(status.as_str(), r#"{"m1": -500, "m2": -500}"#);
        assert_eq!(dispatcher.driver().duty_pair(MotorId::Left).reverse, 500);
    }

    #[test]
    fn replies_follow_side_effects() {
        let registry = Registry::new();
        let inbox = Inbox::default();
        let handle = registry
            .join(ChannelName::Control, inbox.clone(), "peer")
            .handle()
            .unwrap();

        let queue = Queue::new(QueueOrder::Fifo);
        queue
            .submit(Command::new(Verb::SetMotorPowers, Some(250)).reply_to(handle))
            .unwrap();
        queue
            .submit(Command::new(Verb::GetStatus, None).reply_to(handle))
            .unwrap();

        let mut dispatcher = dispatcher();
        let report = block_on(dispatcher.drain_and_execute(&queue, &registry));

        assert_eq!(report.executed, 2);
        assert_eq!(report.replies_sent, 2);
        assert_eq!(
            *inbox.frames.borrow(),
            [
                "# HELLO <peer>",
                r#"{"result": "ok"}"#,
                r#"{"result": "{\"m1\": 250, \"m2\": 250}"}"#,
            ]
        );
    }

    #[test]
    fn replies_to_departed_sessions_are_discarded() {
        let registry = Registry::new();
        let handle = registry
            .join(ChannelName::Control, Inbox::default(), "peer")
            .handle()
            .unwrap();
        registry.leave(handle);

        let queue = Queue::new(QueueOrder::Fifo);
        queue
            .submit(Command::new(Verb::Stop, None).reply_to(handle))
            .unwrap();

        let mut dispatcher = dispatcher();
        let report = block_on(dispatcher.drain_and_execute(&queue, &registry));
        assert_eq!(report.executed, 1);
        assert_eq!(report.replies_discarded, 1);
    }

    #[test]
    fn teleop_frame_precedes_queued_commands() {
        let registry = Registry::new();
        let queue = Queue::new(QueueOrder::Fifo);
        queue.submit(Command::new(Verb::Wait, Some(10))).unwrap();
        queue.post_teleop(MotorFrame { m1: 300, m2: -300 });

        let mut dispatcher = dispatcher();
        let report = block_on(dispatcher.drain_and_execute(&queue, &registry));

        assert_eq!(report.teleop_applied, 1);
        assert_eq!(report.executed, 1);
        assert_eq!(
            dispatcher.observer.changes[0].1,
            MotorStatus { m1: 300, m2: -300 }
        );
        assert_eq!(dispatcher.pause.pauses, [10]);
    }

    type Log = Rc<RefCell<Vec<StdString>>>;

    /// Posts a teleop frame as the pause starts, then finishes on the second poll.
    struct SteeredPause<'q> {
        queue: &'q Queue,
        frame: MotorFrame,
        log: Log,
    }

    impl MotionPause for SteeredPause<'_> {
        fn pause(&mut self, ms: u32) -> impl Future<Output = ()> {
            self.log.borrow_mut().push(std::format!("pause {ms}"));
            self.queue.post_teleop(self.frame);
            let log = Rc::clone(&self.log);
            let mut started = false;
            core::future::poll_fn(move |cx| {
                if started {
                    log.borrow_mut().push("pause end".into());
                    Poll::Ready(())
                } else {
                    started = true;
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
            })
        }
    }

    struct LogObserver(Log);

    impl DutyObserver for LogObserver {
        fn duty_changed(&mut self, _pins: PinDuties, status: MotorStatus) {
            self.0.borrow_mut().push(std::format!("duty {status}"));
        }
    }

    fn steered_dispatcher<'q>(
        queue: &'q Queue,
        log: &Log,
    ) -> CommandDispatcher<NullOutputs, SteeredPause<'q>, LogObserver> {
        CommandDispatcher::new(
            ActuatorDriver::new(NullOutputs),
            SteeredPause {
                queue,
                frame: MotorFrame { m1: 700, m2: 700 },
                log: Rc::clone(log),
            },
            LogObserver(Rc::clone(log)),
            DriveConfig::default(),
        )
    }

    #[test]
    fn teleop_applies_during_long_wait() {
        let registry = Registry::new();
        let queue = Queue::new(QueueOrder::Fifo);
        queue.submit(Command::new(Verb::Wait, Some(i32::MAX))).unwrap();

        let log = Log::default();
        let mut dispatcher = steered_dispatcher(&queue, &log);
        let report = block_on(dispatcher.drain_and_execute(&queue, &registry));

        assert_eq!(report.executed, 1);
        assert_eq!(report.teleop_applied, 1);
        assert_eq!(
            *log.borrow(),
            [
                std::format!("pause {MAX_PAUSE_MS}"),
                StdString::from(r#"duty {"m1": 700, "m2": 700}"#),
                StdString::from("pause end"),
            ]
        );
    }

    #[test]
    fn teleop_during_pulse_skips_trailing_stop() {
        let registry = Registry::new();
        let queue = Queue::new(QueueOrder::Fifo);
        queue.submit(Command::new(Verb::Backward, Some(100))).unwrap();

        let log = Log::default();
        let mut dispatcher = steered_dispatcher(&queue, &log);
        block_on(dispatcher.drain_and_execute(&queue, &registry));

        assert_eq!(
            *log.borrow(),
            [
                r#"duty {"m1": -1000, "m2": -1000}"#,
                "pause 100",
                r#"duty {"m1": 700, "m2": 700}"#,
                "pause end",
            ]
        );
        assert_eq!(dispatcher.driver().status(), MotorStatus { m1: 700, m2: 700 });
    }

    #[test]
    fn unchanged_duties_do_not_notify() {
        let mut dispatcher = dispatcher();
        block_on(dispatcher.execute(&Command::new(Verb::Stop, None)));
        assert!(dispatcher.observer.changes.is_empty());
    }
}
