//! System memory-pressure classification and buffer shedding.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pool::BufferPool;
use crate::observe::{EventStream, StateStream};

/// Consecutive Critical signals before a warning is surfaced.
const CRITICAL_WARN_AFTER: u32 = 2;

/// Memory pressure, ordered from none to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureLevel {
    Normal,
    Low,
    Medium,
    Critical,
}

impl PressureLevel {
    /// Factor applied to periodic update intervals.
    pub fn interval_multiplier(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Low => 1.5,
            Self::Medium => 2.0,
            Self::Critical => 4.0,
        }
    }

    /// Whether non-essential buffers must be released.
    pub fn releases_buffers(self) -> bool {
        self != Self::Normal
    }

    /// Whether repeated signals at this level warrant a user-visible warning.
    pub fn warns(self) -> bool {
        self == Self::Critical
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// An independent system memory signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PressureSignal {
    /// Fraction of memory still available (`MemAvailable / MemTotal`).
    AvailableRatio(f64),
    /// PSI `some avg10` stall percentage from `/proc/pressure/memory`.
    Stall(f64),
    /// An explicit level from the host environment.
    Level(PressureLevel),
}

impl PressureSignal {
    pub fn classify(self) -> PressureLevel {
        match self {
            Self::AvailableRatio(r) if r > 0.25 => PressureLevel::Normal,
            Self::AvailableRatio(r) if r > 0.15 => PressureLevel::Low,
            Self::AvailableRatio(r) if r > 0.05 => PressureLevel::Medium,
            Self::AvailableRatio(_) => PressureLevel::Critical,
            Self::Stall(p) if p < 10.0 => PressureLevel::Normal,
            Self::Stall(p) if p < 25.0 => PressureLevel::Low,
            Self::Stall(p) if p < 50.0 => PressureLevel::Medium,
            Self::Stall(_) => PressureLevel::Critical,
            Self::Level(level) => level,
        }
    }

    /// Sample `/proc/meminfo`. None when unreadable or malformed.
    pub async fn sample_meminfo(path: &Path) -> Option<Self> {
        let text = tokio::fs::read_to_string(path).await.ok()?;
        parse_meminfo(&text).map(Self::AvailableRatio)
    }
}

fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    (total > 0.0).then(|| available / total)
}

/// Surfaced after repeated Critical signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PressureWarning {
    pub level: PressureLevel,
    pub consecutive: u32,
}

type FrequencyCallback = Box<dyn Fn(f64) + Send + Sync>;

struct ControllerState {
    level: PressureLevel,
    consecutive: u32,
    warned: bool,
}

/// Turns memory signals into update-rate changes and buffer shedding.
pub struct PressureController {
    pool: Arc<BufferPool>,
    state: Mutex<ControllerState>,
    level: StateStream<PressureLevel>,
    warnings: EventStream<PressureWarning>,
    callbacks: Mutex<Vec<FrequencyCallback>>,
}

impl PressureController {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            state: Mutex::new(ControllerState {
                level: PressureLevel::Normal,
                consecutive: 0,
                warned: false,
            }),
            level: StateStream::new(PressureLevel::Normal),
            warnings: EventStream::default(),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback that receives the interval multiplier on every
    /// level change.
    pub fn register_frequency_callback(&self, callback: impl Fn(f64) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Handle one signal and return the resulting level.
    pub async fn on_signal(&self, signal: PressureSignal) -> PressureLevel {
        let level = signal.classify();
        let (changed, warn) = {
            let mut state = self.state.lock();
            let changed = state.level != level;
            if changed {
                state.level = level;
                state.consecutive = 1;
                state.warned = false;
            } else {
                state.consecutive = state.consecutive.saturating_add(1);
            }
            let warn = level.warns() && state.consecutive >= CRITICAL_WARN_AFTER && !state.warned;
            if warn {
                state.warned = true;
            }
            (changed, warn.then_some(state.consecutive))
        };

        if changed {
            tracing::info!(%level, "memory pressure level changed");
            self.level.set(level);
            let multiplier = level.interval_multiplier();
            for callback in self.callbacks.lock().iter() {
                callback(multiplier);
            }
        }

        if level.releases_buffers() {
            self.pool.release_non_essential().await;
        }

        if let Some(consecutive) = warn {
            tracing::warn!(%level, consecutive, "sustained critical memory pressure");
            self.warnings.publish(PressureWarning { level, consecutive });
        }
        level
    }

    pub fn level(&self) -> PressureLevel {
        self.level.get()
    }

    pub fn subscribe_level(&self) -> watch::Receiver<PressureLevel> {
        self.level.subscribe()
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<PressureWarning> {
        self.warnings.subscribe()
    }

    /// Poll `/proc/meminfo` every `interval` until `shutdown` fires.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let meminfo = Path::new("/proc/meminfo");
                        if let Some(signal) = PressureSignal::sample_meminfo(meminfo).await {
                            this.on_signal(signal).await;
                        }
                    }
                }
            }
        })
    }
}
