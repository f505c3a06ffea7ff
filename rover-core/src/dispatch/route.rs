use core::fmt;

use embassy_sync::blocking_mutex::raw::RawMutex;

use super::{Command, CommandQueue, SubmitError};
use crate::protocol::{self, ProtocolError};
use crate::session::{ChannelName, SessionHandle};

/// Where an inbound frame went.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Routed {
    /// Decoded control request, queued with the sender as reply target.
    Queued(Command),
    /// Motor frame posted to the teleop mailbox.
    Teleop,
}

/// Why an inbound frame was dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RouteError {
    Malformed(ProtocolError),
    Busy(SubmitError),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::Malformed(err) => err.fmt(f),
            RouteError::Busy(err) => err.fmt(f),
        }
    }
}

/// Decodes one frame received on `channel` and hands it to the control loop.
pub fn route_frame<M: RawMutex, const N: usize>(
    channel: ChannelName,
    frame: &str,
    handle: SessionHandle,
    queue: &CommandQueue<M, N>,
) -> Result<Routed, RouteError> {
    match channel {
        ChannelName::Control => {
            let request = protocol::decode_control(frame).map_err(RouteError::Malformed)?;
            let command = Command::from_request(request, Some(handle));
            queue.submit(command).map_err(RouteError::Busy)?;
            Ok(Routed::Queued(command))
        }
        ChannelName::Telemetry => {
            let motors = protocol::decode_motor_frame(frame).map_err(RouteError::Malformed)?;
            queue.post_teleop(motors);
            Ok(Routed::Teleop)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{QueueOrder, Verb};
    use crate::protocol::MotorFrame;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;

    type Queue = CommandQueue<NoopRawMutex, 2>;

    fn handle(channel: ChannelName) -> SessionHandle {
        SessionHandle {
            channel,
            generation: 1,
        }
    }

    #[test]
    fn control_frames_queue_with_reply_handle() {
        let queue = Queue::new(QueueOrder::Fifo);
        let routed = route_frame(
            ChannelName::Control,
            r#"{"cmd": "turn_left", "param": 150}"#,
            handle(ChannelName::Control),
            &queue,
        )
        .unwrap();

        let queued = queue.pop().unwrap();
        assert_eq!(routed, Routed::Queued(queued));
        assert_eq!(queued.verb, Verb::TurnLeft);
        assert_eq!(queued.param, Some(150));
        assert_eq!(queued.reply_to, Some(handle(ChannelName::Control)));
    }

    #[test]
    fn telemetry_frames_bypass_the_queue() {
        let queue = Queue::new(QueueOrder::Fifo);
        let routed = route_frame(
            ChannelName::Telemetry,
            r#"{"m1": -20, "m2": 20}"#,
            handle(ChannelName::Telemetry),
            &queue,
        );

        assert_eq!(routed, Ok(Routed::Teleop));
        assert!(queue.is_empty());
        assert_eq!(queue.teleop().take(), Some(MotorFrame { m1: -20, m2: 20 }));
    }

    #[test]
    fn malformed_and_overflowing_frames_are_reported() {
        let queue = Queue::new(QueueOrder::Fifo);
        let control = handle(ChannelName::Control);

        assert_eq!(
            route_frame(ChannelName::Control, r#"{"cmd": "Fly"}"#, control, &queue),
            Err(RouteError::Malformed(ProtocolError::UnknownVerb))
        );

        for _ in 0..2 {
            route_frame(ChannelName::Control, r#"{"cmd": "stop"}"#, control, &queue).unwrap();
        }
        assert_eq!(
            route_frame(ChannelName::Control, r#"{"cmd": "stop"}"#, control, &queue),
            Err(RouteError::Busy(SubmitError::Full))
        );
    }
}
