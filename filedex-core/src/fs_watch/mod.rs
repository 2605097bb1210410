//! Filesystem watch pipeline.
//!
//! A thin wrapper around `notify`: one recursive watcher per existing target
//! feeds a bounded channel without ever blocking the OS delivery thread. A
//! single normalizer task owns the [`Debouncer`] and hands closed windows to
//! a pool of workers partitioned by path hash, so events for one path are
//! applied in window-close order while unrelated paths proceed in parallel.
//! Both ends of a move are pinned to the worker that applies it for a while,
//! so later events on either path queue behind the move.
//!
//! Overflow (a full channel, a backend error or a rescan flag) is surfaced
//! explicitly and answered with a resync sweep once the backlog drains.

mod convert;

use std::collections::HashMap;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, spawn_blocking};
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::IndexError;
use crate::normalizer::{Debouncer, LogicalEvent};
use crate::reconciler::{ApplyOptions, Reconciler};
use crate::sweep::StartupSweep;
use crate::types::WatchTarget;

pub(crate) use convert::{Converted, PathScope, convert_event};

const IDLE_WAKE: Duration = Duration::from_secs(3600);

/// How long a moved path stays routed to the move's worker after its last
/// event.
const PIN_TTL: Duration = Duration::from_secs(30);

/// Builds and starts watch pipelines for a fixed set of targets.
pub struct FsWatchService {
    config: WatchConfig,
    targets: Vec<WatchTarget>,
    ignored: Vec<PathBuf>,
    reconciler: Arc<Reconciler>,
    sweep: Arc<StartupSweep>,
}

impl fmt::Debug for FsWatchService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsWatchService")
            .field("config", &self.config)
            .field("targets", &self.targets)
            .field("ignored", &self.ignored)
            .finish()
    }
}

impl FsWatchService {
    pub fn new(
        config: WatchConfig,
        targets: Vec<WatchTarget>,
        reconciler: Arc<Reconciler>,
        sweep: Arc<StartupSweep>,
    ) -> Self {
        Self {
            config,
            targets,
            ignored: Vec::new(),
            reconciler,
            sweep,
        }
    }

    /// Never report changes to `path` (and siblings sharing its name as a
    /// prefix). Used for the index database itself.
    pub fn ignore(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignored.push(path.into());
        self
    }

    /// Subscribes to every existing target, then spawns the pipeline.
    ///
    /// Workers hold events until [`WatchHandle::release`] is called, so a
    /// startup sweep can run between subscribing and applying.
    pub async fn start(&self) -> WatchHandle {
        let (tx, rx) = mpsc::channel::<WatchMessage>(self.config.channel_capacity());
        let overflow = Arc::new(AtomicBool::new(false));

        let roots: Vec<PathBuf> = self
            .targets
            .iter()
            .map(|target| target.root().to_path_buf())
            .collect();
        let init_roots = roots.clone();
        let init_overflow = Arc::clone(&overflow);
        let (watchers, active_roots) =
            match spawn_blocking(move || init_watchers(init_roots, tx, init_overflow)).await {
                Ok(initialized) => initialized,
                Err(join_err) => {
                    warn!(error = %join_err, "watcher initialization panicked");
                    (Vec::new(), Vec::new())
                }
            };

        info!(
            active = active_roots.len(),
            configured = roots.len(),
            "filesystem watchers subscribed"
        );

        let scope = PathScope::new(roots, self.ignored.clone());
        let mut handle = self.spawn_pipeline(rx, scope, overflow);
        handle.watchers = watchers;
        handle.active_roots = active_roots;
        handle
    }

    fn spawn_pipeline(
        &self,
        rx: mpsc::Receiver<WatchMessage>,
        scope: PathScope,
        overflow: Arc<AtomicBool>,
    ) -> WatchHandle {
        let cancel = CancellationToken::new();
        let (gate, gate_rx) = watch::channel(false);
        let capacity = self.config.channel_capacity();

        let mut senders = Vec::new();
        let mut workers = Vec::new();
        for id in 0..self.config.worker_count() {
            let (worker_tx, worker_rx) = mpsc::channel(capacity);
            senders.push(worker_tx);
            workers.push(tokio::spawn(run_worker(
                id,
                worker_rx,
                Arc::clone(&self.reconciler),
                gate_rx.clone(),
            )));
        }

        let pipeline = Pipeline {
            scope,
            router: Router::new(senders.len()),
            debouncer: Debouncer::new(
                self.config.debounce_window(),
                self.config.max_pending_paths,
            ),
            senders,
            overflow,
            sweep: Arc::clone(&self.sweep),
            resync: None,
        };
        let normalizer = tokio::spawn(run_normalizer(
            rx,
            pipeline,
            cancel.clone(),
            self.config.expiry_interval(),
        ));

        WatchHandle {
            watchers: Vec::new(),
            active_roots: Vec::new(),
            cancel,
            gate,
            normalizer,
            workers,
        }
    }
}

/// A running pipeline. Dropping it without [`WatchHandle::stop`] still ends
/// OS delivery; the spawned tasks then drain and exit on their own.
pub struct WatchHandle {
    watchers: Vec<RecommendedWatcher>,
    active_roots: Vec<PathBuf>,
    cancel: CancellationToken,
    gate: watch::Sender<bool>,
    normalizer: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("active_roots", &self.active_roots)
            .field("released", &*self.gate.borrow())
            .field("workers", &self.workers.len())
            .field("normalizer_finished", &self.normalizer.is_finished())
            .finish()
    }
}

impl WatchHandle {
    /// Roots that were successfully subscribed.
    pub fn active_roots(&self) -> &[PathBuf] {
        &self.active_roots
    }

    /// Lets workers start applying events.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.gate.borrow()
    }

    /// Stops OS delivery, flushes every queued and pending event through the
    /// reconciler, then waits for the workers to finish.
    pub async fn stop(mut self) {
        self.watchers.clear();
        self.cancel.cancel();
        self.release();

        if let Err(err) = (&mut self.normalizer).await {
            warn!(error = %err, "watch normalizer ended abnormally");
        }
        for worker in self.workers.drain(..) {
            if let Err(err) = worker.await {
                warn!(error = %err, "watch worker ended abnormally");
            }
        }
        info!("filesystem watch stopped");
    }
}

enum WatchMessage {
    Event(Event),
    Error { root: PathBuf, error: String },
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error { root, error } => f
                .debug_struct("WatchMessage::Error")
                .field("root", root)
                .field("error", error)
                .finish(),
        }
    }
}

struct Pipeline {
    scope: PathScope,
    router: Router,
    debouncer: Debouncer,
    senders: Vec<mpsc::Sender<LogicalEvent>>,
    overflow: Arc<AtomicBool>,
    sweep: Arc<StartupSweep>,
    resync: Option<JoinHandle<()>>,
}

impl Pipeline {
    async fn ingest(&mut self, event: Event) {
        match convert_event(&self.scope, &event) {
            Converted::Rescan => {
                warn!("watch backend requested a rescan");
                self.overflow.store(true, Ordering::Release);
            }
            Converted::Events(raws) => {
                for raw in raws {
                    let forced = self.debouncer.push(raw, Instant::now());
                    self.dispatch(forced).await;
                }
            }
        }
    }

    async fn dispatch(&mut self, events: Vec<LogicalEvent>) {
        let now = Instant::now();
        for event in events {
            let slot = self.router.route(&event, now);
            if self.senders[slot].send(event).await.is_err() {
                warn!(worker = slot, "watch worker gone, event dropped");
            }
        }
    }

    fn maybe_resync(&mut self) {
        if self.resync.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        if !self.overflow.swap(false, Ordering::AcqRel) {
            return;
        }

        info!("watch backlog drained, starting resync sweep");
        let sweep = Arc::clone(&self.sweep);
        self.resync = Some(tokio::spawn(async move {
            if let Err(err) = sweep.run().await {
                warn!(error = %err, "resync sweep failed");
            }
        }));
    }
}

async fn run_normalizer(
    mut rx: mpsc::Receiver<WatchMessage>,
    mut pipeline: Pipeline,
    cancel: CancellationToken,
    expiry_every: Duration,
) {
    let mut expiry = tokio::time::interval(expiry_every);
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut draining = false;

    loop {
        let deadline = pipeline.debouncer.next_deadline();
        let wake = deadline.unwrap_or_else(|| Instant::now() + IDLE_WAKE);

        tokio::select! {
            _ = cancel.cancelled(), if !draining => {
                // Stop accepting, keep what is already queued.
                rx.close();
                draining = true;
            }
            message = rx.recv() => match message {
                Some(WatchMessage::Event(event)) => pipeline.ingest(event).await,
                Some(WatchMessage::Error { root, error }) => {
                    let err = IndexError::WatchSubscriptionFailed { path: root, reason: error };
                    warn!(error = %err, "watch backend error");
                    pipeline.overflow.store(true, Ordering::Release);
                }
                None => break,
            },
            _ = sleep_until(wake), if deadline.is_some() => {
                let due = pipeline.debouncer.drain_due(Instant::now());
                pipeline.dispatch(due).await;
            }
            _ = expiry.tick() => {
                let now = Instant::now();
                let expired = pipeline.debouncer.expire(now);
                let unpinned = pipeline.router.expire(now);
                if expired > 0 || unpinned > 0 {
                    debug!(expired, unpinned, "expired remembered watch keys");
                }
            }
        }

        if !draining && rx.is_empty() {
            pipeline.maybe_resync();
        }
    }

    let remaining = pipeline.debouncer.drain_all(Instant::now());
    if !remaining.is_empty() {
        debug!(count = remaining.len(), "flushing pending windows");
    }
    pipeline.dispatch(remaining).await;

    if let Some(resync) = pipeline.resync.take()
        && !resync.is_finished()
    {
        // The next start sweeps again.
        resync.abort();
    }
    // Dropping the senders lets workers finish their queues.
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<LogicalEvent>,
    reconciler: Arc<Reconciler>,
    mut gate: watch::Receiver<bool>,
) {
    if gate.wait_for(|released| *released).await.is_err() {
        debug!(worker = id, "watch gate dropped before release");
    }

    while let Some(event) = rx.recv().await {
        if let Some(outcome) = reconciler.apply_passive(&event, ApplyOptions::WATCH).await {
            debug!(
                worker = id,
                path = %event.path.display(),
                kind = %event.kind,
                ?outcome,
                "applied filesystem event"
            );
        }
    }
}

/// Chooses the worker for each closed window.
#[derive(Debug)]
struct Router {
    workers: usize,
    pinned: HashMap<PathBuf, (usize, Instant)>,
}

impl Router {
    fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            pinned: HashMap::new(),
        }
    }

    fn route(&mut self, event: &LogicalEvent, now: Instant) -> usize {
        let Some(from) = event.from_path.as_deref() else {
            return self.touch(&event.path, now);
        };
        let slot = self
            .pinned_slot(&event.path)
            .or_else(|| self.pinned_slot(from))
            .unwrap_or_else(|| partition(&event.path, self.workers));
        self.pinned.insert(from.to_path_buf(), (slot, now));
        self.pinned.insert(event.path.clone(), (slot, now));
        slot
    }

    fn touch(&mut self, path: &Path, now: Instant) -> usize {
        match self.pinned.get_mut(path) {
            Some((slot, seen)) => {
                *seen = now;
                *slot
            }
            None => partition(path, self.workers),
        }
    }

    fn pinned_slot(&self, path: &Path) -> Option<usize> {
        self.pinned.get(path).map(|(slot, _)| *slot)
    }

    fn expire(&mut self, now: Instant) -> usize {
        let before = self.pinned.len();
        self.pinned
            .retain(|_, (_, seen)| now.saturating_duration_since(*seen) < PIN_TTL);
        before - self.pinned.len()
    }
}

fn partition(path: &Path, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

fn init_watchers(
    roots: Vec<PathBuf>,
    tx: mpsc::Sender<WatchMessage>,
    overflow: Arc<AtomicBool>,
) -> (Vec<RecommendedWatcher>, Vec<PathBuf>) {
    let mut watchers = Vec::with_capacity(roots.len());
    let mut active = Vec::with_capacity(roots.len());

    for root in roots {
        if !root.is_dir() {
            let err = IndexError::WatchSubscriptionFailed {
                path: root.clone(),
                reason: "directory does not exist".into(),
            };
            warn!(error = %err, "skipping watch target");
            continue;
        }

        match subscribe(&root, tx.clone(), Arc::clone(&overflow)) {
            Ok(watcher) => {
                debug!(root = %root.display(), "watching");
                watchers.push(watcher);
                active.push(root);
            }
            Err(err) => warn!(error = %err, "skipping watch target"),
        }
    }

    (watchers, active)
}

fn subscribe(
    root: &Path,
    tx: mpsc::Sender<WatchMessage>,
    overflow: Arc<AtomicBool>,
) -> Result<RecommendedWatcher, IndexError> {
    let callback_root = root.to_path_buf();
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| {
            let message = match res {
                Ok(event) => WatchMessage::Event(event),
                Err(err) => WatchMessage::Error {
                    root: callback_root.clone(),
                    error: err.to_string(),
                },
            };
            match tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    if !overflow.swap(true, Ordering::AcqRel) {
                        warn!(
                            root = %callback_root.display(),
                            "watch channel full, events will be recovered by a resync"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => {}
            }
        },
        NotifyConfig::default(),
    )
    .map_err(|err| IndexError::WatchSubscriptionFailed {
        path: root.to_path_buf(),
        reason: err.to_string(),
    })?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|err| IndexError::WatchSubscriptionFailed {
            path: root.to_path_buf(),
            reason: err.to_string(),
        })?;

    Ok(watcher)
}
