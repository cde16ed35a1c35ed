use super::setup::{self, SetupStatus};
use super::task_window::{self, DueSoonTask};
use crate::config::EngineOptions;
use crate::session::SnapshotSet;
use chrono::{DateTime, FixedOffset, Local};
use log::{debug, trace};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

/// Source of "now" for the due-soon window.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Wall clock in the local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(Mutex<DateTime<FixedOffset>>);

impl ManualClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Output of one recomputation.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedState {
    /// 0 for the initial state, incremented by every recomputation
    pub revision: u64,
    pub setup: SetupStatus,
    pub due_soon: Vec<DueSoonTask>,
    pub computed_at: DateTime<FixedOffset>,
}

/// Both derivations over one set of snapshots. Pure and total.
pub fn derive(
    snapshots: &SnapshotSet,
    now: DateTime<FixedOffset>,
    options: &EngineOptions,
) -> (SetupStatus, Vec<DueSoonTask>) {
    let setup = setup::evaluate(
        &snapshots.network.value,
        &snapshots.devices.value,
        &snapshots.profile.value,
        &options.reserved_names,
    );
    let due_soon = task_window::filter(&snapshots.tasks.value.0, now, options.due_soon_window_days);
    (setup, due_soon)
}

/// Recomputes the derived state from feed snapshots and publishes it on a
/// watch channel.
pub struct DerivedStateEngine {
    options: EngineOptions,
    clock: Box<dyn Clock>,
    state: watch::Sender<DerivedState>,
}

impl DerivedStateEngine {
    pub fn new(options: EngineOptions, clock: Box<dyn Clock>) -> Self {
        let now = clock.now();
        let (setup, due_soon) = derive(&SnapshotSet::default(), now, &options);
        let (state, _) = watch::channel(DerivedState {
            revision: 0,
            setup,
            due_soon,
            computed_at: now,
        });
        Self {
            options,
            clock,
            state,
        }
    }

    /// Derives a new state and publishes it with the next revision number.
    /// The revision is assigned while publishing, so concurrent callers
    /// never share one.
    pub fn recompute(&self, snapshots: &SnapshotSet) -> DerivedState {
        let now = self.clock.now();
        let (setup, due_soon) = derive(snapshots, now, &self.options);
        let mut next = DerivedState {
            revision: 0,
            setup,
            due_soon,
            computed_at: now,
        };
        self.state.send_modify(|state| {
            next.revision = state.revision + 1;
            *state = next.clone();
        });
        trace!(
            "Derived state r{}: complete={} due_soon={}",
            next.revision,
            next.setup.is_complete(),
            next.due_soon.len()
        );
        next
    }

    pub fn current(&self) -> DerivedState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DerivedState> {
        self.state.subscribe()
    }

    /// Number of recomputations so far.
    pub fn recomputations(&self) -> u64 {
        self.state.borrow().revision
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

/// Runs `recompute` once per burst of change notifications.
///
/// The first notification opens a window of `window`; everything arriving
/// before it closes is folded into the same recomputation. The task ends when
/// every sender is dropped.
pub fn spawn_debounced<F>(
    mut changes: mpsc::UnboundedReceiver<String>,
    window: Duration,
    mut recompute: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(first) = changes.recv().await {
            let deadline = Instant::now() + window;
            let mut coalesced = 1usize;
            while let Ok(Some(_)) = timeout_at(deadline, changes.recv()).await {
                coalesced += 1;
            }
            debug!(
                "Recomputing after {} change(s), first from '{}'",
                coalesced, first
            );
            recompute();
        }
        trace!("Change channel closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, TaskList};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn at(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn test_initial_state_is_conservative() {
        let engine = DerivedStateEngine::new(
            EngineOptions::default(),
            Box::new(ManualClock::new(at("2024-01-10T00:00:00Z"))),
        );
        let state = engine.current();
        assert_eq!(state.revision, 0);
        assert!(!state.setup.is_complete());
        assert!(state.due_soon.is_empty());
    }

    #[test]
    fn test_recompute_reads_clock_and_snapshots() {
        let clock = Arc::new(ManualClock::new(at("2024-01-10T00:00:00Z")));
        struct Shared(Arc<ManualClock>);
        impl Clock for Shared {
            fn now(&self) -> DateTime<FixedOffset> {
                self.0.now()
            }
        }
        let engine = DerivedStateEngine::new(EngineOptions::default(), Box::new(Shared(clock.clone())));
        let mut rx = engine.subscribe();

        let mut snapshots = SnapshotSet::default();
        snapshots.tasks.value = TaskList(vec![Task {
            id: "t".into(),
            deadline: Some(at("2024-01-12T00:00:00Z")),
            ..Default::default()
        }]);

        assert_eq!(engine.recompute(&snapshots).due_soon.len(), 1);
        assert!(rx.has_changed().unwrap());

        clock.set(at("2024-01-13T00:00:00Z"));
        let state = engine.recompute(&snapshots);
        assert!(state.due_soon.is_empty());
        assert_eq!(state.revision, 2);
        assert_eq!(rx.borrow_and_update().revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = spawn_debounced(rx, Duration::from_millis(150), move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        for i in 0..10 {
            tx.send(format!("feed-{}", i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tx.send("tasks".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send("devices".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        drop(tx);
        worker.await.unwrap();
    }

    #[test]
    fn test_concurrent_recomputes_get_distinct_revisions() {
        let engine = Arc::new(DerivedStateEngine::new(
            EngineOptions::default(),
            Box::new(ManualClock::new(at("2024-01-10T00:00:00Z"))),
        ));
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| engine.recompute(&SnapshotSet::default()).revision)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut revisions: Vec<u64> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        revisions.sort_unstable();
        revisions.dedup();
        assert_eq!(revisions.len(), 400);
        assert_eq!(engine.recomputations(), 400);
        assert_eq!(engine.current().revision, 400);
    }
}
