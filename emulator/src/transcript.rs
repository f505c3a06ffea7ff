use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of a transcript line.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Session,
    Control,
    Serial,
    Sensor,
    Console,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::Session => "SESS ",
            Role::Control => "CTRL ",
            Role::Serial => "UART ",
            Role::Sensor => "MIC  ",
            Role::Console => "EMU <",
        }
    }
}

/// Timestamped event log shared by every emulator thread.
///
/// Lines go to stdout and, when a path was given, to a transcript file.
pub struct Transcript {
    started_at: Instant,
    file: Mutex<Option<BufWriter<File>>>,
}

impl Transcript {
    pub fn new(path: Option<&Path>) -> io::Result<Self> {
        let file = match path {
            Some(path) => Some(open_transcript(path)?),
            None => None,
        };

        Ok(Self {
            started_at: Instant::now(),
            file: Mutex::new(file),
        })
    }

    pub fn line(&self, role: Role, message: impl Display) {
        let text = format_line(self.started_at.elapsed(), role, &message);
        println!("{text}");

        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(writer) = file.as_mut() {
            let written = writeln!(writer, "{text}").and_then(|()| writer.flush());
            if let Err(err) = written {
                eprintln!("transcript write failed, disabling: {err}");
                *file = None;
            }
        }
    }
}

fn open_transcript(path: &Path) -> io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;

    let mut writer = BufWriter::new(file);
    writeln!(writer, "# Rover emulator transcript")?;
    writeln!(writer, "# Timestamps are milliseconds since start")?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(writer)
}

fn format_line(elapsed: Duration, role: Role, message: &dyn Display) -> String {
    format!("[+{:>6} ms] {} {message}", elapsed.as_millis(), role.prefix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_carry_elapsed_millis_and_role() {
        let line = format_line(Duration::from_millis(42), Role::Session, &"joined");
        assert_eq!(line, "[+    42 ms] SESS  joined");
    }

    #[test]
    fn transcript_file_receives_header_and_lines() {
        let dir = std::env::temp_dir().join(format!("rover-transcript-{}", std::process::id()));
        let path = dir.join("run.log");
        let transcript = Transcript::new(Some(&path)).unwrap();
        transcript.line(Role::Control, "Stop executed");
        drop(transcript);

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("# Rover emulator transcript"));
        assert!(contents.contains("CTRL  Stop executed"));
        let _ = fs::remove_dir_all(dir);
    }
}
