//! Line-oriented TCP stand-in for the robot's websocket endpoints.
//!
//! A client sends the endpoint path (`/controller_ws` or `/motors_ws`) as its
//! first line, then one JSON frame per line. Every connection gets its own
//! receive thread plus a writer thread fed by the transport's outbound queue.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Sender};
use std::thread;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use rover_core::dispatch::{CommandQueue, QUEUE_DEPTH, Routed, route_frame};
use rover_core::session::{
    ChannelName, JoinOutcome, SessionHandle, SessionRegistry, Transport, TransportError,
};

use crate::transcript::{Role, Transcript};

pub type Registry = SessionRegistry<CriticalSectionRawMutex, TcpTransport>;
pub type Queue = CommandQueue<CriticalSectionRawMutex, QUEUE_DEPTH>;

enum Outbound {
    Text(String),
    Close,
}

/// Session transport over a TCP stream. Sends only enqueue.
pub struct TcpTransport {
    outbound: Sender<Outbound>,
}

impl TcpTransport {
    pub fn spawn(stream: TcpStream) -> Self {
        let (outbound, pending) = mpsc::channel();
        let mut writer = stream;
        thread::spawn(move || {
            for message in pending {
                match message {
                    Outbound::Text(text) => {
                        let sent = writer
                            .write_all(text.as_bytes())
                            .and_then(|()| writer.write_all(b"\n"));
                        if sent.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => break,
                }
            }
            let _ = writer.shutdown(Shutdown::Both);
        });
        Self { outbound }
    }
}

impl Transport for TcpTransport {
    fn send_text(&self, text: &str) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text.to_owned()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Accepts connections until the listener fails.
pub fn serve(
    listener: &TcpListener,
    sessions: &Arc<Registry>,
    queue: &Arc<Queue>,
    log: &Arc<Transcript>,
) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                log.line(Role::Session, format_args!("accept failed: {err}"));
                continue;
            }
        };

        let sessions = Arc::clone(sessions);
        let queue = Arc::clone(queue);
        let log = Arc::clone(log);
        thread::spawn(move || {
            if let Err(err) = handle_connection(stream, &sessions, &queue, &log) {
                log.line(Role::Session, format_args!("connection error: {err}"));
            }
        });
    }
}

fn handle_connection(
    stream: TcpStream,
    sessions: &Registry,
    queue: &Queue,
    log: &Transcript,
) -> io::Result<()> {
    let peer = stream.peer_addr()?.to_string();
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut path = String::new();
    reader.read_line(&mut path)?;
    let Some(channel) = ChannelName::from_path(&path) else {
        log.line(
            Role::Session,
            format_args!("{peer} refused: unknown path {:?}", path.trim()),
        );
        let _ = stream.shutdown(Shutdown::Both);
        return Ok(());
    };

    let transport = TcpTransport::spawn(stream);
    let handle = match sessions.join(channel, transport, &peer) {
        JoinOutcome::Accepted(handle) => handle,
        JoinOutcome::Rejected => {
            log.line(Role::Session, format_args!("{channel}: REJECTED <{peer}>"));
            return Ok(());
        }
    };
    log.line(Role::Session, format_args!("{channel}: HELLO <{peer}>"));

    let received = receive_frames(&mut reader, channel, handle, queue, log);
    if sessions.leave(handle) {
        log.line(Role::Session, format_args!("{channel}: <{peer}> left"));
    }
    received
}

fn receive_frames(
    reader: &mut impl BufRead,
    channel: ChannelName,
    handle: SessionHandle,
    queue: &Queue,
    log: &Transcript,
) -> io::Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let frame = line.trim();
        if frame.is_empty() {
            continue;
        }
        match route_frame(channel, frame, handle, queue) {
            Ok(Routed::Queued(command)) => {
                log.line(Role::Control, format_args!("{}({:?})", command.verb, command.param));
            }
            Ok(Routed::Teleop) => {}
            Err(err) => log.line(Role::Control, format_args!("{channel}: dropped frame: {err}")),
        }
    }
}
