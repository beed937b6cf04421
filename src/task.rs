use serde::Serialize;
use std::{
    panic,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrayDependencyStage {
    Preparing,
    IndexingPackages,
    ParsingTray,
    MatchingDirectReferences,
    ExpandingDependencies,
    CopyingMods,
    WritingOutputs,
    Completed,
}

impl TrayDependencyStage {
    pub fn label(self) -> &'static str {
        match self {
            TrayDependencyStage::Preparing => "Preparing",
            TrayDependencyStage::IndexingPackages => "Indexing packages",
            TrayDependencyStage::ParsingTray => "Parsing tray",
            TrayDependencyStage::MatchingDirectReferences => "Matching direct references",
            TrayDependencyStage::ExpandingDependencies => "Expanding dependencies",
            TrayDependencyStage::CopyingMods => "Copying mods",
            TrayDependencyStage::WritingOutputs => "Writing outputs",
            TrayDependencyStage::Completed => "Completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrayDependencyProgress {
    pub stage: TrayDependencyStage,
    pub percent: u8,
    pub detail: String,
}

pub type ProgressCallback = Arc<dyn Fn(TrayDependencyProgress) + Send + Sync>;

/// Forwards progress to an optional callback, never letting the percent
/// move backwards.
pub(crate) struct ProgressReporter {
    callback: Option<ProgressCallback>,
    last_percent: AtomicU8,
}

impl ProgressReporter {
    pub(crate) fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            last_percent: AtomicU8::new(0),
        }
    }

    pub(crate) fn report(&self, stage: TrayDependencyStage, percent: u8, detail: impl Into<String>) {
        let percent = percent.min(100);
        let previous = self.last_percent.fetch_max(percent, Ordering::SeqCst);
        let percent = percent.max(previous);
        let detail = detail.into();
        tracing::debug!(stage = stage.label(), percent, "{detail}");
        let Some(callback) = &self.callback else {
            return;
        };
        callback(TrayDependencyProgress {
            stage,
            percent,
            detail,
        });
    }

    /// Maps `current / total` into the `[start, end]` percent band.
    pub(crate) fn report_fraction(
        &self,
        stage: TrayDependencyStage,
        start: u8,
        end: u8,
        current: usize,
        total: usize,
        detail: impl Into<String>,
    ) {
        let total = total.max(1);
        let current = current.min(total);
        let span = end.saturating_sub(start) as usize;
        let percent = start as usize + span * current / total;
        self.report(stage, percent as u8, detail);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Handle to work running on its own thread. Returned before the work
/// starts, so callers stay responsive.
pub struct TaskHandle<T> {
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> TaskHandle<T> {
    pub(crate) fn spawn<F>(work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            handle: thread::spawn(work),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Blocks until the work completes. A panic on the worker is resumed here.
    pub fn join(self) -> T {
        match self.handle.join() {
            Ok(value) => value,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
