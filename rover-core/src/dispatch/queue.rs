//! Multi-producer command queue and the teleop latest-value slot.

use core::cell::{Cell, RefCell};
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::signal::Signal;
use heapless::Deque;

use super::Command;
use crate::protocol::MotorFrame;

/// Order in which queued commands leave the queue.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum QueueOrder {
    /// Oldest first. Preserves each submitter's order.
    #[default]
    Fifo,
    /// Newest first, as a stack.
    Lifo,
}

/// Submission refused by the queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SubmitError {
    /// The queue is at capacity; the command was dropped.
    Full,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Full => f.write_str("command queue full"),
        }
    }
}

/// Holds only the most recent telemetry frame.
pub struct TeleopMailbox<M: RawMutex> {
    latest: Mutex<M, Cell<Option<MotorFrame>>>,
    arrived: Signal<M, ()>,
}

impl<M: RawMutex> TeleopMailbox<M> {
    pub const fn new() -> Self {
        Self {
            latest: Mutex::new(Cell::new(None)),
            arrived: Signal::new(),
        }
    }

    /// Replaces any unapplied frame. Returns `true` if one was overwritten.
    pub fn post(&self, frame: MotorFrame) -> bool {
        let replaced = self
            .latest
            .lock(|latest| latest.replace(Some(frame)).is_some());
        self.arrived.signal(());
        replaced
    }

    /// Resolves once a frame has been posted since the last wait. The frame
    /// may already have been taken by then.
    pub async fn wait(&self) {
        self.arrived.wait().await;
    }

    /// Takes the pending frame, if any.
    pub fn take(&self) -> Option<MotorFrame> {
        self.latest.lock(Cell::take)
    }
}

impl<M: RawMutex> Default for TeleopMailbox<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded many-producer, single-consumer command queue.
///
/// Producers never block beyond the short critical section around the
/// deque. Every successful submission, and every teleop post, rings the
/// doorbell the control loop waits on.
pub struct CommandQueue<M: RawMutex, const N: usize> {
    order: QueueOrder,
    pending: Mutex<M, RefCell<Deque<Command, N>>>,
    teleop: TeleopMailbox<M>,
    doorbell: Signal<M, ()>,
}

impl<M: RawMutex, const N: usize> CommandQueue<M, N> {
    pub const fn new(order: QueueOrder) -> Self {
        Self {
            order,
            pending: Mutex::new(RefCell::new(Deque::new())),
            teleop: TeleopMailbox::new(),
            doorbell: Signal::new(),
        }
    }

    pub const fn order(&self) -> QueueOrder {
        self.order
    }

    /// Appends a command. Safe from any context; never waits for the consumer.
    pub fn submit(&self, command: Command) -> Result<(), SubmitError> {
        self.pending.lock(|pending| {
            pending
                .borrow_mut()
                .push_back(command)
                .map_err(|_| SubmitError::Full)
        })?;
        self.doorbell.signal(());
        Ok(())
    }

    /// Posts a teleop frame and wakes the control loop.
    pub fn post_teleop(&self, frame: MotorFrame) -> bool {
        let replaced = self.teleop.post(frame);
        self.doorbell.signal(());
        replaced
    }

    pub fn teleop(&self) -> &TeleopMailbox<M> {
        &self.teleop
    }

    /// Removes the next command according to the ordering policy.
    pub fn pop(&self) -> Option<Command> {
        self.pending.lock(|pending| {
            let mut pending = pending.borrow_mut();
            match self.order {
                QueueOrder::Fifo => pending.pop_front(),
                QueueOrder::Lifo => pending.pop_back(),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.pending.lock(|pending| pending.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once work has been submitted since the last wait.
    pub async fn wait(&self) {
        self.doorbell.wait().await;
    }

    /// Returns `true` and clears the doorbell if it was rung.
    pub fn take_doorbell(&self) -> bool {
        self.doorbell.try_take().is_some()
    }
}
