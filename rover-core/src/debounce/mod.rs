//! Edge-triggered sensor debouncing.
//!
//! Every sensor line is a two-state machine. While **armed** the line's edge
//! interrupt is delivered; the first edge moves it to **cooling**: the handler
//! disables the interrupt, arms a one-shot timer and reports a [`Detection`].
//! The timer callback re-enables the line. Handlers only touch atomics and the
//! two capability traits, so they are safe to call from interrupt context.
//!
//! With [`CooldownScope::Array`] the lines form one correlated array (the
//! microphone ring): the first edge on any line cools the whole array, which
//! reports which sensor heard an event first and suppresses the echoes picked
//! up by its neighbours.

use core::time::Duration;

use portable_atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Default window during which a fired line stays silent.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(2_000);

/// Position labels of the microphone ring, in line order.
pub const MICROPHONE_LABELS: [&str; 4] = ["left", "right", "back", "front"];

/// Index of a sensor line within its debouncer.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SensorId(pub u8);

impl SensorId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Interrupt gating for the sensor lines.
pub trait EdgeLines {
    /// Stops edge delivery for one line.
    fn disable(&self, sensor: SensorId);
    /// Resumes edge delivery for one line.
    fn enable(&self, sensor: SensorId);
}

/// One-shot timers, one per line.
pub trait CooldownTimers {
    /// Arms the line's timer; expiry must call
    /// [`SensorEventDebouncer::on_cooldown_expired`] for the same line.
    fn arm(&self, sensor: SensorId, after: Duration);
}

/// Which lines cool down when one of them fires.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum CooldownScope {
    /// Only the fired line cools; other lines detect independently.
    Line,
    /// Every line of the array cools; one detection per window.
    #[default]
    Array,
}

/// Debouncer tuning.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DebounceConfig {
    pub cooldown: Duration,
    pub scope: CooldownScope,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            cooldown: DEFAULT_COOLDOWN,
            scope: CooldownScope::Array,
        }
    }
}

/// First-arrival event emitted when a line leaves the armed state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Detection {
    pub sensor: SensorId,
    pub label: &'static str,
    /// Running count of detections reported by this debouncer.
    pub sequence: u32,
}

/// Per-line state owned by the debouncer.
#[derive(Debug)]
pub struct SensorChannel {
    id: SensorId,
    label: &'static str,
    armed: AtomicBool,
}

impl SensorChannel {
    fn new(id: SensorId, label: &'static str) -> Self {
        Self {
            id,
            label,
            armed: AtomicBool::new(true),
        }
    }

    pub const fn id(&self) -> SensorId {
        self.id
    }

    pub const fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// Debouncer over `N` sensor lines sharing one pair of capabilities.
pub struct SensorEventDebouncer<L, T, const N: usize> {
    channels: [SensorChannel; N],
    lines: L,
    timers: T,
    config: DebounceConfig,
    array_armed: AtomicBool,
    cooling: AtomicUsize,
    detections: AtomicU32,
}

impl<L, T, const N: usize> SensorEventDebouncer<L, T, N>
where
    L: EdgeLines,
    T: CooldownTimers,
{
    /// Creates a debouncer with every line armed. Line `i` gets `labels[i]`.
    pub fn new(labels: [&'static str; N], lines: L, timers: T, config: DebounceConfig) -> Self {
        let mut index = 0u8;
        let channels = labels.map(|label| {
            let channel = SensorChannel::new(SensorId(index), label);
            index = index.wrapping_add(1);
            channel
        });

        Self {
            channels,
            lines,
            timers,
            config,
            array_armed: AtomicBool::new(true),
            cooling: AtomicUsize::new(0),
            detections: AtomicU32::new(0),
        }
    }

    /// Edge interrupt handler.
    ///
    /// Returns the detection when this edge armed the cooldown, or `None` when
    /// the edge raced an in-progress disablement or arrived while cooling.
    pub fn on_edge(&self, sensor: SensorId) -> Option<Detection> {
        let channel = self.channels.get(sensor.index())?;

        match self.config.scope {
            CooldownScope::Line => {
                if !claim(&channel.armed) {
                    return None;
                }
                self.enter_cooling(channel);
            }
            CooldownScope::Array => {
                if !claim(&self.array_armed) {
                    return None;
                }
                self.cooling.store(N, Ordering::Release);
                for member in &self.channels {
                    member.armed.store(false, Ordering::Release);
                    self.enter_cooling(member);
                }
            }
        }

        let sequence = self.detections.fetch_add(1, Ordering::Relaxed);
        Some(Detection {
            sensor,
            label: channel.label,
            sequence,
        })
    }

    /// One-shot timer callback for a cooling line.
    pub fn on_cooldown_expired(&self, sensor: SensorId) {
        let Some(channel) = self.channels.get(sensor.index()) else {
            return;
        };

        if channel.armed.swap(true, Ordering::AcqRel) {
            // Spurious expiry for a line that is already armed.
            return;
        }

        self.lines.enable(channel.id);

        if self.config.scope == CooldownScope::Array
            && self.cooling.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.array_armed.store(true, Ordering::Release);
        }
    }

    /// Returns `true` when the line would report its next edge.
    pub fn is_armed(&self, sensor: SensorId) -> bool {
        let Some(channel) = self.channels.get(sensor.index()) else {
            return false;
        };

        match self.config.scope {
            CooldownScope::Line => channel.is_armed(),
            CooldownScope::Array => {
                channel.is_armed() && self.array_armed.load(Ordering::Acquire)
            }
        }
    }

    /// Looks up the label of a line.
    pub fn label(&self, sensor: SensorId) -> Option<&'static str> {
        self.channels.get(sensor.index()).map(SensorChannel::label)
    }

    /// Iterates over the lines in index order.
    pub fn channels(&self) -> core::slice::Iter<'_, SensorChannel> {
        self.channels.iter()
    }

    /// Returns the active configuration.
    pub const fn config(&self) -> DebounceConfig {
        self.config
    }

    /// Returns the capability used to gate the lines.
    pub fn lines(&self) -> &L {
        &self.lines
    }

    /// Returns the capability used to arm the cooldown timers.
    pub fn timers(&self) -> &T {
        &self.timers
    }

    fn enter_cooling(&self, channel: &SensorChannel) {
        self.lines.disable(channel.id);
        self.timers.arm(channel.id, self.config.cooldown);
    }
}

/// Atomically moves a flag from `true` to `false`; only one caller wins.
fn claim(flag: &AtomicBool) -> bool {
    flag.compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}
