//! Build phases and progress reporting.
//!
//! Workers send events over a channel; one writer thread owns the sink,
//! collapsing bursts so the consumer sees ordered, rate-limited updates.

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Downloading,
    Cutting,
    Assembly,
    Done,
    Failed,
}

impl Phase {
    /// Share of overall progress owned by this phase, in percent.
    pub fn range(self) -> (f64, f64) {
        match self {
            Phase::Init => (0.0, 0.0),
            Phase::Downloading => (0.0, 50.0),
            Phase::Cutting => (50.0, 90.0),
            Phase::Assembly => (90.0, 100.0),
            Phase::Done | Phase::Failed => (100.0, 100.0),
        }
    }

    pub fn percent(self, fraction: f64) -> f64 {
        let (start, end) = self.range();
        start + (end - start) * fraction.clamp(0.0, 1.0)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Downloading => "downloading",
            Phase::Cutting => "cutting",
            Phase::Assembly => "assembly",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub message: String,
    pub percent: f64,
    #[serde(default)]
    pub details: Value,
}

pub type ProgressSink = Box<dyn FnMut(&ProgressEvent) + Send + 'static>;

/// Sender slot shared by the reporter and its handles. Emptied on shutdown
/// so outstanding handles can never keep the writer alive.
type SharedSender = Arc<Mutex<Option<Sender<ProgressEvent>>>>;

fn send(slot: &SharedSender, event: ProgressEvent) {
    if let Ok(guard) = slot.lock() {
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }
}

pub struct ProgressReporter {
    tx: SharedSender,
    last_percent: Arc<AtomicU64>,
    writer: Option<JoinHandle<()>>,
}

/// Cloneable, `'static` side channel into a reporter, for callbacks that
/// outlive a borrow (download byte counts). Updates keep the current overall
/// percent. Once the reporter finishes, sends are dropped.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: SharedSender,
    last_percent: Arc<AtomicU64>,
}

impl ProgressHandle {
    pub fn detail(&self, phase: Phase, message: impl Into<String>, details: Value) {
        let event = ProgressEvent {
            phase,
            message: message.into(),
            percent: f64::from_bits(self.last_percent.load(Ordering::Relaxed)),
            details,
        };
        send(&self.tx, event);
    }
}

impl ProgressReporter {
    pub fn new(sink: ProgressSink, min_interval: Duration) -> Self {
        let (tx, rx) = channel::unbounded();
        let writer = std::thread::Builder::new()
            .name("progress-writer".to_string())
            .spawn(move || writer_loop(rx, sink, min_interval))
            .ok();
        Self {
            tx: Arc::new(Mutex::new(Some(tx))),
            last_percent: Arc::new(AtomicU64::new(0f64.to_bits())),
            writer,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        ProgressHandle {
            tx: Arc::clone(&self.tx),
            last_percent: Arc::clone(&self.last_percent),
        }
    }

    /// Reporter whose only sink is the tracing log.
    pub fn logging() -> Self {
        Self::new(
            Box::new(|event: &ProgressEvent| {
                tracing::info!(
                    phase = event.phase.as_str(),
                    percent = event.percent,
                    "{}",
                    event.message
                );
            }),
            DEFAULT_MIN_INTERVAL,
        )
    }

    pub fn emit(&self, phase: Phase, fraction: f64, message: impl Into<String>, details: Value) {
        let percent = phase.percent(fraction);
        self.last_percent.store(percent.to_bits(), Ordering::Relaxed);
        let event = ProgressEvent {
            phase,
            message: message.into(),
            percent,
            details,
        };
        send(&self.tx, event);
    }

    /// Flush pending events and stop the writer.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(rx: Receiver<ProgressEvent>, mut sink: ProgressSink, min_interval: Duration) {
    let mut last_phase: Option<Phase> = None;
    let mut last_emit: Option<Instant> = None;
    let mut pending: Option<ProgressEvent> = None;

    for event in rx.iter() {
        let phase_changed = last_phase != Some(event.phase);
        let due = last_emit.is_none_or(|at| at.elapsed() >= min_interval);
        if phase_changed || due {
            if phase_changed {
                if let Some(held) = pending.take() {
                    sink(&held);
                }
            }
            sink(&event);
            last_phase = Some(event.phase);
            last_emit = Some(Instant::now());
            pending = None;
        } else {
            pending = Some(event);
        }
    }

    if let Some(held) = pending {
        sink(&held);
    }
}
