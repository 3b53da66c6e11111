//! Background compaction.
//!
//! A compactor run picks sparsely loaded read-only segments, copies their
//! live records into fresh target segments and proposes the new addresses
//! to the writer through update batches. It never touches the address
//! mapping itself: the writer reconciles every proposal against the
//! current mapping and drops the ones it has already overwritten.
//!
//! ```text
//!          start              candidates found
//!   Idle ---------> Inspecting ----------------> Compacting
//!    ^                  |                             |
//!    |                  | nothing to do               |
//!    |                  v                             |
//!    +-------------- Done <---------------------------+
//! ```

mod batch;
mod run;

pub use batch::{batch_channel, BatchConsumer, BatchProducer, BatchSender, Relocation, UpdateBatch};
pub use run::CompactionSummary;
pub(crate) use run::{compact, inspect, CompactionContext};

use crate::error::{CoreError, CoreResult};
use crate::types::SegmentId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Name of the background compaction thread.
pub const COMPACTOR_THREAD_NAME: &str = "segdb-compactor";

const NO_TARGET: u64 = u64::MAX;

/// Where a compactor run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactorState {
    /// No run has started yet.
    Idle,
    /// Selecting source segments.
    Inspecting,
    /// Copying records out of the selected sources.
    Compacting,
    /// The last run has finished.
    Done,
}

impl CompactorState {
    /// Whether a run is in flight.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Inspecting | Self::Compacting)
    }
}

/// Runs compaction on a background thread, one run at a time.
#[derive(Debug)]
pub struct Compactor {
    state: Mutex<CompactorState>,
    changed: Condvar,
    cancelled: AtomicBool,
    target: AtomicU64,
    last_summary: Mutex<Option<CompactionSummary>>,
}

impl Default for Compactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compactor {
    /// Creates an idle compactor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CompactorState::Idle),
            changed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            target: AtomicU64::new(NO_TARGET),
            last_summary: Mutex::new(None),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CompactorState {
        *self.state.lock()
    }

    /// Whether a run is in flight.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Starts `run` on the compactor thread unless a run is in flight.
    ///
    /// The state moves to [`CompactorState::Inspecting`] before the thread
    /// is spawned, so a second call made right after this one returns
    /// `false`. The state becomes [`CompactorState::Done`] when `run`
    /// returns or panics.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the thread cannot be spawned.
    pub fn start<F>(self: &Arc<Self>, run: F) -> CoreResult<bool>
    where
        F: FnOnce(&Compactor) -> CoreResult<CompactionSummary> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.is_running() {
                return Ok(false);
            }
            *state = CompactorState::Inspecting;
        }
        self.cancelled.store(false, Ordering::Release);
        *self.last_summary.lock() = None;

        let compactor = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(COMPACTOR_THREAD_NAME.to_string())
            .spawn(move || {
                let _finish = FinishGuard(&compactor);
                match run(&compactor) {
                    Ok(summary) => *compactor.last_summary.lock() = Some(summary),
                    Err(err) => tracing::warn!(error = %err, "compactor run failed"),
                }
            });

        match spawned {
            Ok(_) => Ok(true),
            Err(err) => {
                self.finish();
                Err(CoreError::Io(err))
            }
        }
    }

    /// Moves an inspecting run on to copying.
    pub(crate) fn enter_compacting(&self) {
        let mut state = self.state.lock();
        if *state == CompactorState::Inspecting {
            *state = CompactorState::Compacting;
        }
    }

    fn finish(&self) {
        self.target.store(NO_TARGET, Ordering::Release);
        *self.state.lock() = CompactorState::Done;
        self.changed.notify_all();
    }

    /// Asks the current run to stop at its next record.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether [`Self::cancel`] was called since the run started.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Target segment the current run is copying into.
    #[must_use]
    pub fn current_target(&self) -> Option<SegmentId> {
        match self.target.load(Ordering::Acquire) {
            NO_TARGET => None,
            id => SegmentId::try_from(id).ok(),
        }
    }

    pub(crate) fn set_current_target(&self, id: SegmentId) {
        self.target.store(u64::from(id), Ordering::Release);
    }

    /// Summary of the most recent successful run.
    #[must_use]
    pub fn last_summary(&self) -> Option<CompactionSummary> {
        self.last_summary.lock().clone()
    }

    /// Blocks until no run is in flight, calling `between` roughly every
    /// millisecond while waiting.
    ///
    /// The caller uses `between` to keep draining update batches; a run
    /// blocked on a full channel would otherwise never finish.
    pub fn wait_idle(&self, mut between: impl FnMut()) {
        let mut state = self.state.lock();
        while state.is_running() {
            self.changed.wait_for(&mut state, Duration::from_millis(1));
            if state.is_running() {
                parking_lot::MutexGuard::unlocked(&mut state, &mut between);
            }
        }
    }
}

struct FinishGuard<'a>(&'a Compactor);

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn one_run_at_a_time() {
        let compactor = Arc::new(Compactor::new());
        let (release, wait) = mpsc::channel::<()>();

        let started = compactor
            .start(move |_| {
                let _ = wait.recv();
                Ok(CompactionSummary::default())
            })
            .unwrap();
        assert!(started);
        assert!(compactor.is_running());
        assert!(!compactor.start(|_| Ok(CompactionSummary::default())).unwrap());

        release.send(()).unwrap();
        compactor.wait_idle(|| {});
        assert_eq!(compactor.state(), CompactorState::Done);
        assert!(compactor.last_summary().is_some());
    }

    #[test]
    fn thread_is_named() {
        let compactor = Arc::new(Compactor::new());
        let (tx, rx) = mpsc::channel();
        compactor
            .start(move |_| {
                tx.send(thread::current().name().map(str::to_string)).unwrap();
                Ok(CompactionSummary::default())
            })
            .unwrap();

        assert_eq!(rx.recv().unwrap().as_deref(), Some(COMPACTOR_THREAD_NAME));
        compactor.wait_idle(|| {});
    }

    #[test]
    fn state_moves_through_compacting() {
        let compactor = Arc::new(Compactor::new());
        let (tx, rx) = mpsc::channel();
        compactor
            .start(move |c| {
                tx.send(c.state()).unwrap();
                c.enter_compacting();
                tx.send(c.state()).unwrap();
                c.set_current_target(4);
                tx.send(c.state()).unwrap();
                Ok(CompactionSummary::default())
            })
            .unwrap();

        assert_eq!(rx.recv().unwrap(), CompactorState::Inspecting);
        assert_eq!(rx.recv().unwrap(), CompactorState::Compacting);
        rx.recv().unwrap();
        compactor.wait_idle(|| {});
        assert_eq!(compactor.current_target(), None);
    }

    #[test]
    fn panicking_run_still_finishes() {
        let compactor = Arc::new(Compactor::new());
        compactor
            .start(|_| -> CoreResult<CompactionSummary> { panic!("boom") })
            .unwrap();
        compactor.wait_idle(|| {});
        assert!(!compactor.is_running());
        assert!(compactor.last_summary().is_none());
    }

    #[test]
    fn wait_idle_calls_between() {
        let compactor = Arc::new(Compactor::new());
        let (release, wait) = mpsc::channel::<()>();
        compactor
            .start(move |_| {
                let _ = wait.recv();
                Ok(CompactionSummary::default())
            })
            .unwrap();

        let mut calls = 0;
        let mut release = Some(release);
        compactor.wait_idle(|| {
            calls += 1;
            if calls == 3 {
                if let Some(tx) = release.take() {
                    tx.send(()).unwrap();
                }
            }
        });
        assert!(calls >= 3);
    }

    #[test]
    fn cancel_flag_resets_on_start() {
        let compactor = Arc::new(Compactor::new());
        compactor.cancel();
        assert!(compactor.is_cancelled());

        let (tx, rx) = mpsc::channel();
        compactor
            .start(move |c| {
                tx.send(c.is_cancelled()).unwrap();
                Ok(CompactionSummary::default())
            })
            .unwrap();
        assert!(!rx.recv().unwrap());
        compactor.wait_idle(|| {});
    }
}
