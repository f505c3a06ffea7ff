//! Telemetry ring buffer and logging helpers.
//!
//! Keeps the last [`TELEMETRY_RING_CAPACITY`] session, control-loop and
//! microphone events with timestamps, and mirrors each one to defmt on target
//! or stdout on the host so bring-up does not need a debugger attached.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Instant};
use heapless::history_buf::{HistoryBuf, OldestOrdered};
use rover_core::debounce::SensorId;
use rover_core::dispatch::DrainReport;
use rover_core::session::ChannelName;

/// Total number of telemetry entries retained in memory.
pub const TELEMETRY_RING_CAPACITY: usize = 64;

/// Monotonic identifier attached to every record.
pub type EventId = u32;

pub type TelemetryRing = HistoryBuf<TelemetryRecord, TELEMETRY_RING_CAPACITY>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TelemetryEventKind {
    SessionJoined(ChannelName),
    SessionRejected(ChannelName),
    SessionLeft(ChannelName),
    FrameDropped(ChannelName),
    /// One control-loop drain pass.
    Drained {
        executed: u16,
        discarded: u16,
    },
    Detection {
        sensor: SensorId,
        label: &'static str,
        /// Time since the previous detection, if any.
        elapsed_since_previous: Option<Duration>,
    },
    PresenceChanged(bool),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub id: EventId,
    pub timestamp: Instant,
    pub event: TelemetryEventKind,
}

/// Records events into a fixed-size ring and mirrors them to the log.
pub struct TelemetryRecorder {
    ring: TelemetryRing,
    last_detection_at: Option<Instant>,
    next_event_id: EventId,
}

impl TelemetryRecorder {
    pub const fn new() -> Self {
        Self {
            ring: HistoryBuf::new(),
            last_detection_at: None,
            next_event_id: 0,
        }
    }

    /// Recorded telemetry in chronological order.
    pub fn oldest_first(&self) -> OldestOrdered<'_, TelemetryRecord> {
        self.ring.oldest_ordered()
    }

    pub fn latest(&self) -> Option<&TelemetryRecord> {
        self.ring.recent()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Records a first-arrival detection along with the gap since the last one.
    pub fn record_detection(
        &mut self,
        sensor: SensorId,
        label: &'static str,
        timestamp: Instant,
    ) -> EventId {
        let elapsed = self
            .last_detection_at
            .map(|previous| timestamp.saturating_duration_since(previous));
        self.last_detection_at = Some(timestamp);

        self.record(
            TelemetryEventKind::Detection {
                sensor,
                label,
                elapsed_since_previous: elapsed,
            },
            timestamp,
        )
    }

    /// Records a drain pass. Idle passes are not worth a slot.
    pub fn record_drain(&mut self, report: &DrainReport, timestamp: Instant) -> Option<EventId> {
        if report.is_idle() {
            return None;
        }
        let executed = u16::try_from(report.executed + report.teleop_applied).unwrap_or(u16::MAX);
        let discarded = u16::try_from(report.replies_discarded).unwrap_or(u16::MAX);
        Some(self.record(
            TelemetryEventKind::Drained {
                executed,
                discarded,
            },
            timestamp,
        ))
    }

    pub fn record(&mut self, event: TelemetryEventKind, timestamp: Instant) -> EventId {
        let id = self.next_event_id;
        self.next_event_id = self.next_event_id.wrapping_add(1);

        self.ring.write(TelemetryRecord {
            id,
            timestamp,
            event,
        });
        emit_log(&event, timestamp.as_micros());

        id
    }
}

impl Default for TelemetryRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Recorder shared by every task.
pub struct SharedTelemetry {
    inner: Mutex<CriticalSectionRawMutex, RefCell<TelemetryRecorder>>,
}

impl SharedTelemetry {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(TelemetryRecorder::new())),
        }
    }

    /// Runs `f` against the recorder with the lock held.
    pub fn with<R>(&self, f: impl FnOnce(&mut TelemetryRecorder) -> R) -> R {
        self.inner.lock(|recorder| f(&mut recorder.borrow_mut()))
    }

    pub fn record(&self, event: TelemetryEventKind) -> EventId {
        self.with(|recorder| recorder.record(event, Instant::now()))
    }
}

impl Default for SharedTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "none")]
fn emit_log(event: &TelemetryEventKind, timestamp_us: u64) {
    match *event {
        TelemetryEventKind::SessionJoined(channel) => {
            defmt::info!("telemetry:session {} joined t={}us", channel.label(), timestamp_us);
        }
        TelemetryEventKind::SessionRejected(channel) => {
            defmt::warn!("telemetry:session {} rejected t={}us", channel.label(), timestamp_us);
        }
        TelemetryEventKind::SessionLeft(channel) => {
            defmt::info!("telemetry:session {} left t={}us", channel.label(), timestamp_us);
        }
        TelemetryEventKind::FrameDropped(channel) => {
            defmt::warn!("telemetry:session {} frame dropped t={}us", channel.label(), timestamp_us);
        }
        TelemetryEventKind::Drained {
            executed,
            discarded,
        } => {
            defmt::debug!(
                "telemetry:control executed={} discarded={} t={}us",
                executed,
                discarded,
                timestamp_us
            );
        }
        TelemetryEventKind::Detection {
            label,
            elapsed_since_previous,
            ..
        } => match elapsed_since_previous {
            Some(delta) => defmt::info!(
                "telemetry:mic first arrival {} t={}us Δ={}us",
                label,
                timestamp_us,
                delta.as_micros()
            ),
            None => defmt::info!("telemetry:mic first arrival {} t={}us", label, timestamp_us),
        },
        TelemetryEventKind::PresenceChanged(present) => {
            defmt::info!("telemetry:serial presence={} t={}us", present, timestamp_us);
        }
    }
}

#[cfg(not(target_os = "none"))]
fn emit_log(event: &TelemetryEventKind, timestamp_us: u64) {
    match *event {
        TelemetryEventKind::SessionJoined(channel) => {
            println!("telemetry:session {channel} joined t={timestamp_us}us");
        }
        TelemetryEventKind::SessionRejected(channel) => {
            println!("telemetry:session {channel} rejected t={timestamp_us}us");
        }
        TelemetryEventKind::SessionLeft(channel) => {
            println!("telemetry:session {channel} left t={timestamp_us}us");
        }
        TelemetryEventKind::FrameDropped(channel) => {
            println!("telemetry:session {channel} frame dropped t={timestamp_us}us");
        }
        TelemetryEventKind::Drained {
            executed,
            discarded,
        } => {
            println!(
                "telemetry:control executed={executed} discarded={discarded} t={timestamp_us}us"
            );
        }
        TelemetryEventKind::Detection {
            label,
            elapsed_since_previous,
            ..
        } => match elapsed_since_previous {
            Some(delta) => println!(
                "telemetry:mic first arrival {label} t={timestamp_us}us Δ={}us",
                delta.as_micros()
            ),
            None => println!("telemetry:mic first arrival {label} t={timestamp_us}us"),
        },
        TelemetryEventKind::PresenceChanged(present) => {
            println!("telemetry:serial presence={present} t={timestamp_us}us");
        }
    }
}
