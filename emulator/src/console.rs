//! Interactive stdin console standing in for the serial radio link.
//!
//! Lines that are not console commands are fed byte by byte to the serial
//! bridge, exactly as the radio module would deliver them.

use std::io::{self, BufRead, Write};

use rover_core::debounce::{MICROPHONE_LABELS, SensorId};
use rover_core::serial::{PresenceGate, SerialBridge};

use crate::hardware::{self, Microphones, PinBank, SimPresence};
use crate::server::Queue;
use crate::transcript::{Role, Transcript};

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("w/a/s/d/h", "drive keys, delivered over the simulated radio link"),
    ("present <on|off>", "toggle the radio pairing line"),
    ("mic <left|right|back|front>...", "sound edges on the listed microphones together"),
    ("pins", "show the live PWM duties"),
    ("help", "show this list"),
    ("exit", "stop the emulator"),
];

/// A parsed console line.
#[derive(Debug, PartialEq, Eq)]
pub enum ConsoleCommand<'a> {
    Presence(bool),
    Sound(Vec<SensorId>),
    Pins,
    Help,
    Exit,
    Keys(&'a [u8]),
    Invalid(String),
}

pub fn parse_line(line: &str) -> ConsoleCommand<'_> {
    let mut words = line.split_whitespace();
    let Some(first) = words.next() else {
        return ConsoleCommand::Keys(&[]);
    };

    match first.to_ascii_lowercase().as_str() {
        "present" => match words.next() {
            Some("on") => ConsoleCommand::Presence(true),
            Some("off") => ConsoleCommand::Presence(false),
            _ => ConsoleCommand::Invalid("usage: present <on|off>".to_string()),
        },
        "mic" => {
            let mut sensors = Vec::new();
            for word in words {
                match MICROPHONE_LABELS.iter().position(|label| *label == word) {
                    Some(index) => sensors.push(SensorId(u8::try_from(index).unwrap_or(u8::MAX))),
                    None => return ConsoleCommand::Invalid(format!("unknown microphone `{word}`")),
                }
            }
            if sensors.is_empty() {
                ConsoleCommand::Invalid("usage: mic <label>...".to_string())
            } else {
                ConsoleCommand::Sound(sensors)
            }
        }
        "pins" => ConsoleCommand::Pins,
        "help" => ConsoleCommand::Help,
        "exit" | "quit" => ConsoleCommand::Exit,
        _ => ConsoleCommand::Keys(line.as_bytes()),
    }
}

/// Everything the console can poke.
pub struct Console<'a> {
    pub queue: &'a Queue,
    pub bridge: SerialBridge<SimPresence>,
    pub pins: &'a PinBank,
    pub microphones: &'a Microphones,
    pub log: &'a Transcript,
}

impl Console<'_> {
    pub fn run(&self) -> io::Result<()> {
        let stdin = io::stdin();
        let mut reader = stdin.lock();
        let mut line = String::new();

        loop {
            line.clear();
            {
                let mut stdout = io::stdout().lock();
                write!(stdout, "> ")?;
                stdout.flush()?;
            }

            if reader.read_line(&mut line)? == 0 {
                println!();
                return Ok(());
            }

            if !self.handle(parse_line(line.trim_end_matches(['\r', '\n']))) {
                println!("Emulator stopped.");
                return Ok(());
            }
        }
    }

    /// Returns `false` when the console should exit.
    fn handle(&self, command: ConsoleCommand<'_>) -> bool {
        match command {
            ConsoleCommand::Presence(present) => {
                self.bridge.gate().set(present);
                self.log.line(
                    Role::Serial,
                    if present { "peer paired" } else { "peer gone" },
                );
            }
            ConsoleCommand::Sound(sensors) => {
                std::thread::scope(|scope| {
                    for sensor in sensors {
                        scope.spawn(move || hardware::sound(self.microphones, sensor, self.log));
                    }
                });
            }
            ConsoleCommand::Pins => println!("{}", self.pins.snapshot()),
            ConsoleCommand::Help => {
                for (topic, text) in HELP_TOPICS {
                    println!("  {topic:<32} {text}");
                }
            }
            ConsoleCommand::Exit => return false,
            ConsoleCommand::Keys(bytes) => {
                if bytes.is_empty() {
                    return true;
                }
                let report = self.bridge.feed(bytes, self.queue);
                if report.submitted > 0 || report.dropped > 0 {
                    self.log.line(
                        Role::Serial,
                        format_args!(
                            "{} key(s) queued, {} dropped",
                            report.submitted, report.dropped
                        ),
                    );
                } else if !self.bridge.gate().is_present() {
                    self.log.line(Role::Serial, "no peer; bytes ignored");
                }
            }
            ConsoleCommand::Invalid(message) => println!("ERR {message}"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_words_are_commands() {
        assert_eq!(parse_line("present on"), ConsoleCommand::Presence(true));
        assert_eq!(parse_line("PINS"), ConsoleCommand::Pins);
        assert_eq!(
            parse_line("mic left back"),
            ConsoleCommand::Sound(vec![SensorId(0), SensorId(2)])
        );
        assert_eq!(parse_line("quit"), ConsoleCommand::Exit);
    }

    #[test]
    fn everything_else_is_radio_bytes() {
        assert_eq!(parse_line("wwd"), ConsoleCommand::Keys(b"wwd"));
        assert_eq!(parse_line(""), ConsoleCommand::Keys(b""));
    }

    #[test]
    fn bad_arguments_are_reported() {
        assert!(matches!(parse_line("mic nose"), ConsoleCommand::Invalid(_)));
        assert!(matches!(parse_line("present"), ConsoleCommand::Invalid(_)));
    }
}
