use std::collections::HashMap;
use std::future::Future;
use std::thread;

use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use rover_core::actuator::{ActuatorDriver, DutyOutputs, PolarityOutput};
use rover_core::dispatch::{
    Command, CommandDispatcher, CommandQueue, DriveConfig, MotionPause, NoopObserver, QueueOrder,
    Verb,
};
use rover_core::session::{SessionRegistry, Transport, TransportError};

const SUBMITTERS: u32 = 4;
const PER_SUBMITTER: u32 = 16;

struct NullOutputs;

impl DutyOutputs for NullOutputs {
    fn set_duty(&mut self, _output: PolarityOutput, _duty: u16) {}
}

/// Records every pause; the `Wait` parameter doubles as a command tag.
#[derive(Default)]
struct TagLog {
    tags: Vec<u32>,
}

impl MotionPause for TagLog {
    fn pause(&mut self, ms: u32) -> impl Future<Output = ()> {
        self.tags.push(ms);
        std::future::ready(())
    }
}

struct NoTransport;

impl Transport for NoTransport {
    fn send_text(&self, _text: &str) -> Result<(), TransportError> {
        Err(TransportError::Closed)
    }

    fn close(&self) {}
}

fn tag(submitter: u32, index: u32) -> Option<i32> {
    i32::try_from(submitter * 1_000 + index).ok()
}

fn drain_tags<const N: usize>(queue: &CommandQueue<CriticalSectionRawMutex, N>) -> Vec<u32> {
    let sessions: SessionRegistry<CriticalSectionRawMutex, NoTransport> = SessionRegistry::new();
    let mut dispatcher = CommandDispatcher::new(
        ActuatorDriver::new(NullOutputs),
        TagLog::default(),
        NoopObserver,
        DriveConfig::default(),
    );
    let report = block_on(dispatcher.drain_and_execute(queue, &sessions));
    let (_, log, _) = dispatcher.into_parts();
    assert_eq!(report.executed, log.tags.len());
    log.tags
}

#[test]
fn test_fifo_ordering_per_submitter() {
    let queue: CommandQueue<CriticalSectionRawMutex, 64> = CommandQueue::new(QueueOrder::Fifo);

    thread::scope(|scope| {
        for submitter in 0..SUBMITTERS {
            let queue = &queue;
            scope.spawn(move || {
                for index in 0..PER_SUBMITTER {
                    queue
                        .submit(Command::new(Verb::Wait, tag(submitter, index)))
                        .expect("queue sized for every submission");
                }
            });
        }
    });

    let executed = drain_tags(&queue);
    assert_eq!(executed.len(), usize::try_from(SUBMITTERS * PER_SUBMITTER).unwrap());

    let mut last_seen: HashMap<u32, u32> = HashMap::new();
    for tag in executed {
        let submitter = tag / 1_000;
        let index = tag % 1_000;
        if let Some(previous) = last_seen.insert(submitter, index) {
            assert!(
                index > previous,
                "submitter {submitter} executed {index} after {previous}"
            );
        }
    }
    assert_eq!(last_seen.len(), usize::try_from(SUBMITTERS).unwrap());
}

#[test]
fn lifo_policy_reproduces_stack_order() {
    let queue: CommandQueue<CriticalSectionRawMutex, 8> = CommandQueue::new(QueueOrder::Lifo);
    for index in 1..=5 {
        queue
            .submit(Command::new(Verb::Wait, Some(index)))
            .expect("queue has room");
    }

    assert_eq!(
        drain_tags(&queue),
        [5, 4, 3, 2, 1],
        "the stack policy executes the most recent submission first"
    );
}

#[test]
fn submissions_after_a_pop_queue_behind_earlier_work() {
    let queue: CommandQueue<CriticalSectionRawMutex, 8> = CommandQueue::new(QueueOrder::Fifo);
    queue.submit(Command::new(Verb::Wait, Some(1))).unwrap();
    queue.submit(Command::new(Verb::Wait, Some(2))).unwrap();

    let first = queue.pop().expect("first command");
    queue.submit(Command::new(Verb::Wait, Some(3))).unwrap();
    assert_eq!(first.param, Some(1));

    assert_eq!(drain_tags(&queue), [2, 3]);
    assert!(queue.is_empty());
}

#[test]
fn default_policy_is_fifo() {
    assert_eq!(QueueOrder::default(), QueueOrder::Fifo);
    let queue: CommandQueue<CriticalSectionRawMutex, 4> = CommandQueue::new(Default::default());
    assert_eq!(queue.order(), QueueOrder::Fifo);
}
