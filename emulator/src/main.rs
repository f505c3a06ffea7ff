mod console;
mod hardware;
mod server;
mod transcript;

use std::env;
use std::io;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use embassy_futures::block_on;
use rover_core::actuator::ActuatorDriver;
use rover_core::debounce::DEFAULT_COOLDOWN;
use rover_core::dispatch::{CommandDispatcher, DispatchConfig, QueueOrder};
use rover_core::serial::{PresenceEcho, SerialBridge};
use rover_core::session::ChannelName;

use console::Console;
use hardware::{ConsoleSerial, PinBank, SimPresence, SimulatedBridge, ThreadSleep};
use server::{Queue, Registry};
use transcript::{Role, Transcript};

const USAGE: &str = "Usage: rover-emulator [--listen <addr>] [--lifo] [--cooldown-ms <ms>] [--transcript <path>]";
const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, PartialEq, Eq)]
struct Options {
    listen: String,
    dispatch: DispatchConfig,
    cooldown: Duration,
    transcript: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            dispatch: DispatchConfig::default(),
            cooldown: DEFAULT_COOLDOWN,
            transcript: None,
        }
    }
}

fn main() -> io::Result<()> {
    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let log = Arc::new(Transcript::new(options.transcript.as_deref())?);
    let sessions = Arc::new(Registry::new());
    let queue = Arc::new(Queue::new(options.dispatch.order));
    let presence = SimPresence::default();
    let pins = Arc::new(PinBank::default());
    let microphones = hardware::microphones(options.cooldown, log.clone());

    {
        let sessions = sessions.clone();
        let queue = queue.clone();
        let log = log.clone();
        let mut dispatcher = CommandDispatcher::new(
            ActuatorDriver::new(SimulatedBridge::new(pins.clone(), log.clone())),
            ThreadSleep,
            PresenceEcho::new(presence.clone(), ConsoleSerial),
            options.dispatch.drive,
        );
        thread::spawn(move || {
            loop {
                let report = block_on(dispatcher.drain_and_execute(&queue, &sessions));
                if report.is_idle() {
                    thread::sleep(IDLE_POLL);
                    continue;
                }
                log.line(
                    Role::Control,
                    format_args!(
                        "executed {} teleop {} replies {} discarded {} -> {}",
                        report.executed,
                        report.teleop_applied,
                        report.replies_sent,
                        report.replies_discarded,
                        dispatcher.driver().status()
                    ),
                );
            }
        });
    }

    let listener = TcpListener::bind(&options.listen)?;
    log.line(
        Role::Console,
        format_args!(
            "listening on {} ({} / {}), {:?} order",
            listener.local_addr()?,
            ChannelName::Control.path(),
            ChannelName::Telemetry.path(),
            options.dispatch.order
        ),
    );
    {
        let sessions = sessions.clone();
        let queue = queue.clone();
        let log = log.clone();
        thread::spawn(move || server::serve(&listener, &sessions, &queue, &log));
    }

    println!("Rover emulator ready. Type `help` for commands or `exit` to quit.");
    Console {
        queue: &queue,
        bridge: SerialBridge::new(presence),
        pins: &pins,
        microphones: &microphones,
        log: &log,
    }
    .run()
}

fn parse_options(args: impl IntoIterator<Item = String>) -> Result<Options, String> {
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let mut value = |name: &str| {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {name}"))
        };

        match flag.as_str() {
            "--listen" => options.listen = value("--listen")?,
            "--transcript" => options.transcript = Some(PathBuf::from(value("--transcript")?)),
            "--cooldown-ms" => {
                let raw = value("--cooldown-ms")?;
                let ms = raw
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid cooldown `{raw}`"))?;
                options.cooldown = Duration::from_millis(ms);
            }
            "--lifo" => options.dispatch.order = QueueOrder::Lifo,
            "--fifo" => options.dispatch.order = QueueOrder::Fifo,
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Options, String> {
        parse_options(args.iter().map(ToString::to_string))
    }

    #[test]
    fn defaults_without_arguments() {
        let options = parse(&[]).unwrap();
        assert_eq!(options, Options::default());
        assert_eq!(options.dispatch.order, QueueOrder::Fifo);
    }

    #[test]
    fn flags_accept_separate_and_inline_values() {
        let options = parse(&[
            "--listen=0.0.0.0:9000",
            "--cooldown-ms",
            "250",
            "--lifo",
            "--transcript",
            "run.log",
        ])
        .unwrap();

        assert_eq!(options.listen, "0.0.0.0:9000");
        assert_eq!(options.cooldown, Duration::from_millis(250));
        assert_eq!(options.dispatch.order, QueueOrder::Lifo);
        assert_eq!(options.transcript, Some(PathBuf::from("run.log")));
    }

    #[test]
    fn bad_arguments_are_errors() {
        assert!(parse(&["--cooldown-ms", "soon"]).is_err());
        assert!(parse(&["--listen"]).is_err());
        assert!(parse(&["--turbo"]).is_err());
    }
}
