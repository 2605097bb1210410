//! Per-path debouncing and move pairing for raw watch notifications.
//!
//! [`Debouncer`] is a plain state machine driven by explicit instants so the
//! watch loop decides when time passes. Every raw event opens or extends a
//! window for its path; a window closes once no event for the path arrived
//! for one debounce period, and closed windows come out in close order.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::types::FileEventKind;

/// A single notification after path sanitizing, before debouncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Change { kind: FileEventKind, path: PathBuf },
    /// Rename reported with both endpoints.
    Rename { from: PathBuf, to: PathBuf },
}

impl RawEvent {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self::Change {
            kind: FileEventKind::Created,
            path: path.into(),
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self::Change {
            kind: FileEventKind::Modified,
            path: path.into(),
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self::Change {
            kind: FileEventKind::Deleted,
            path: path.into(),
        }
    }

    pub fn renamed(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self::Rename {
            from: from.into(),
            to: to.into(),
        }
    }

    /// The path whose worker partition this event belongs to.
    pub fn key_path(&self) -> &Path {
        match self {
            RawEvent::Change { path, .. } => path,
            RawEvent::Rename { to, .. } => to,
        }
    }
}

/// One logical change, emitted when its debounce window closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalEvent {
    pub kind: FileEventKind,
    pub path: PathBuf,
    /// Source path, set only for `Moved`.
    pub from_path: Option<PathBuf>,
}

impl LogicalEvent {
    pub fn new(kind: FileEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            from_path: None,
        }
    }

    pub fn moved(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            kind: FileEventKind::Moved,
            path: to.into(),
            from_path: Some(from.into()),
        }
    }
}

#[derive(Debug, Clone)]
struct PendingWindow {
    kind: FileEventKind,
    from_path: Option<PathBuf>,
    deadline: Instant,
    seq: u64,
}

type OrderKey = (Instant, u64);

#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    capacity: usize,
    seq: u64,
    pending: HashMap<PathBuf, PendingWindow>,
    /// Pending windows ordered by (deadline, arrival sequence).
    order: BTreeMap<OrderKey, PathBuf>,
    /// Last emitted idempotent kind per path, with its expiry.
    recent: HashMap<PathBuf, (FileEventKind, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seq: 0,
            pending: HashMap::new(),
            order: BTreeMap::new(),
            recent: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn remembered_len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Earliest instant at which a window closes.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.order.first_key_value().map(|((deadline, _), _)| *deadline)
    }

    /// Feeds one raw event. Returns windows closed early because the pending
    /// set grew past its capacity.
    pub fn push(&mut self, raw: RawEvent, now: Instant) -> Vec<LogicalEvent> {
        match raw {
            RawEvent::Change { kind, path } => self.push_change(kind, path, now),
            RawEvent::Rename { from, to } => self.push_rename(from, to, now),
        }
        self.enforce_capacity(now)
    }

    /// Closes every window whose deadline is at or before `now`.
    pub fn drain_due(&mut self, now: Instant) -> Vec<LogicalEvent> {
        let mut out = Vec::new();
        while let Some(entry) = self.order.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let path = entry.remove();
            if let Some(event) = self.close(path, now) {
                out.push(event);
            }
        }
        out
    }

    /// Closes every pending window regardless of deadline.
    pub fn drain_all(&mut self, now: Instant) -> Vec<LogicalEvent> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some((_, path)) = self.order.pop_first() {
            if let Some(event) = self.close(path, now) {
                out.push(event);
            }
        }
        out
    }

    /// Forgets remembered dedup keys older than one window.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.recent.len();
        self.recent.retain(|_, (_, expires)| *expires > now);
        before - self.recent.len()
    }

    fn push_change(&mut self, kind: FileEventKind, path: PathBuf, now: Instant) {
        if let Some(existing) = self.pending.get(&path) {
            let merged = merge_kinds(existing.kind, kind);
            let from_path = if merged == FileEventKind::Moved {
                existing.from_path.clone()
            } else {
                None
            };
            self.schedule(path, merged, from_path, now);
            return;
        }

        if is_idempotent(kind)
            && let Some((last, expires)) = self.recent.get(&path)
            && *last == kind
            && *expires > now
        {
            trace!(path = %path.display(), kind = %kind, "dropping late duplicate");
            return;
        }

        if kind == FileEventKind::Created
            && let Some(source) = self.pairing_candidate(&path)
        {
            self.remove_pending(&source);
            self.schedule(path, FileEventKind::Moved, Some(source), now);
            return;
        }

        self.schedule(path, kind, None, now);
    }

    fn push_rename(&mut self, from: PathBuf, to: PathBuf, now: Instant) {
        if from == to {
            self.push_change(FileEventKind::Modified, to, now);
            return;
        }

        // A rename of something that was itself just moved keeps the original
        // source; a rename of something just created is still a create.
        let origin = match self.remove_pending(&from) {
            Some(PendingWindow {
                kind: FileEventKind::Moved,
                from_path: Some(origin),
                ..
            }) => Some(origin),
            Some(PendingWindow {
                kind: FileEventKind::Created,
                ..
            }) => None,
            _ => Some(from),
        };

        self.remove_pending(&to);
        match origin {
            Some(origin) if origin != to => {
                self.schedule(to, FileEventKind::Moved, Some(origin), now)
            }
            Some(_) => self.schedule(to, FileEventKind::Modified, None, now),
            None => self.schedule(to, FileEventKind::Created, None, now),
        }
    }

    /// A pending plain delete that a create of `path` should pair with: one
    /// with the same file name if present, else the most recent.
    fn pairing_candidate(&self, path: &Path) -> Option<PathBuf> {
        let name = path.file_name();
        let mut best_named: Option<(&PathBuf, u64)> = None;
        let mut best_any: Option<(&PathBuf, u64)> = None;

        for (candidate, window) in &self.pending {
            if window.kind != FileEventKind::Deleted || window.from_path.is_some() {
                continue;
            }
            if best_any.is_none_or(|(_, seq)| window.seq > seq) {
                best_any = Some((candidate, window.seq));
            }
            if name.is_some()
                && candidate.file_name() == name
                && best_named.is_none_or(|(_, seq)| window.seq > seq)
            {
                best_named = Some((candidate, window.seq));
            }
        }

        best_named.or(best_any).map(|(path, _)| path.clone())
    }

    fn schedule(
        &mut self,
        path: PathBuf,
        kind: FileEventKind,
        from_path: Option<PathBuf>,
        now: Instant,
    ) {
        self.remove_pending(&path);
        self.seq += 1;
        let deadline = now + self.window;
        self.order.insert((deadline, self.seq), path.clone());
        self.pending.insert(
            path,
            PendingWindow {
                kind,
                from_path,
                deadline,
                seq: self.seq,
            },
        );
    }

    fn remove_pending(&mut self, path: &Path) -> Option<PendingWindow> {
        let window = self.pending.remove(path)?;
        self.order.remove(&(window.deadline, window.seq));
        Some(window)
    }

    fn close(&mut self, path: PathBuf, now: Instant) -> Option<LogicalEvent> {
        let window = self.pending.remove(&path)?;
        let remembered = match window.kind {
            FileEventKind::Moved => Some(FileEventKind::Created),
            kind if is_idempotent(kind) => Some(kind),
            _ => None,
        };
        match remembered {
            Some(kind) => {
                self.recent.insert(path.clone(), (kind, now + self.window));
            }
            None => {
                self.recent.remove(&path);
            }
        }

        Some(LogicalEvent {
            kind: window.kind,
            path,
            from_path: window.from_path,
        })
    }

    fn enforce_capacity(&mut self, now: Instant) -> Vec<LogicalEvent> {
        let mut out = Vec::new();
        while self.pending.len() > self.capacity {
            let Some((_, path)) = self.order.pop_first() else {
                break;
            };
            if let Some(event) = self.close(path, now) {
                out.push(event);
            }
        }
        if !out.is_empty() {
            trace!(closed = out.len(), "pending capacity exceeded, closing oldest windows");
        }
        out
    }
}

fn is_idempotent(kind: FileEventKind) -> bool {
    matches!(kind, FileEventKind::Created | FileEventKind::Deleted)
}

fn merge_kinds(existing: FileEventKind, incoming: FileEventKind) -> FileEventKind {
    use FileEventKind::*;

    match (existing, incoming) {
        (Moved, _) => Moved,
        (Created, Created | Modified) => Created,
        (Created | Modified, Deleted) => Deleted,
        (Modified, Created | Modified) => Modified,
        (Deleted, Created | Modified) => Modified,
        (Deleted, Deleted) => Deleted,
        (_, Moved) => Moved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_millis(100);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn burst_on_one_path_yields_one_event() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::created("/w/a.txt"), t0);
        for i in 1..=20 {
            d.push(RawEvent::modified("/w/a.txt"), t0 + ms(i * 10));
        }

        // The window keeps sliding while events arrive.
        assert!(d.drain_due(t0 + ms(250)).is_empty());
        assert_eq!(d.next_deadline(), Some(t0 + ms(300)));

        let out = d.drain_due(t0 + ms(300));
        assert_eq!(out, vec![LogicalEvent::new(FileEventKind::Created, "/w/a.txt")]);
        assert!(d.is_idle());
    }

    #[test]
    fn coalescing_rules() {
        let t0 = Instant::now();
        let cases = [
            (
                vec![RawEvent::created("/p"), RawEvent::deleted("/p")],
                FileEventKind::Deleted,
            ),
            (
                vec![RawEvent::modified("/p"), RawEvent::deleted("/p")],
                FileEventKind::Deleted,
            ),
            (
                vec![RawEvent::deleted("/p"), RawEvent::created("/p")],
                FileEventKind::Modified,
            ),
            (
                vec![RawEvent::modified("/p"), RawEvent::modified("/p")],
                FileEventKind::Modified,
            ),
        ];

        for (events, expected) in cases {
            let mut d = Debouncer::new(WINDOW, 1024);
            for (i, event) in events.into_iter().enumerate() {
                d.push(event, t0 + ms(i as u64));
            }
            let out = d.drain_all(t0 + ms(10));
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].kind, expected);
        }
    }

    #[test]
    fn delete_then_create_pairs_into_move() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::deleted("/w/old/report.pdf"), t0);
        d.push(RawEvent::deleted("/w/other.txt"), t0 + ms(5));
        d.push(RawEvent::created("/w/new/report.pdf"), t0 + ms(10));

        let out = d.drain_all(t0 + ms(200));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], LogicalEvent::new(FileEventKind::Deleted, "/w/other.txt"));
        assert_eq!(
            out[1],
            LogicalEvent::moved("/w/old/report.pdf", "/w/new/report.pdf")
        );
    }

    #[test]
    fn pairing_falls_back_to_most_recent_delete() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::deleted("/w/a.tmp"), t0);
        d.push(RawEvent::deleted("/w/b.tmp"), t0 + ms(1));
        d.push(RawEvent::created("/w/c.txt"), t0 + ms(2));

        let out = d.drain_all(t0 + ms(200));
        assert!(out.contains(&LogicalEvent::moved("/w/b.tmp", "/w/c.txt")));
        assert!(out.contains(&LogicalEvent::new(FileEventKind::Deleted, "/w/a.tmp")));
    }

    #[test]
    fn delete_outside_window_is_not_paired() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::deleted("/w/a.txt"), t0);
        let closed = d.drain_due(t0 + ms(150));
        assert_eq!(closed, vec![LogicalEvent::new(FileEventKind::Deleted, "/w/a.txt")]);

        d.push(RawEvent::created("/w/b.txt"), t0 + ms(160));
        let out = d.drain_all(t0 + ms(400));
        assert_eq!(out, vec![LogicalEvent::new(FileEventKind::Created, "/w/b.txt")]);
    }

    #[test]
    fn native_rename_and_chained_renames() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::renamed("/w/a", "/w/b"), t0);
        d.push(RawEvent::renamed("/w/b", "/w/c"), t0 + ms(5));
        d.push(RawEvent::modified("/w/c"), t0 + ms(6));

        let out = d.drain_all(t0 + ms(300));
        assert_eq!(out, vec![LogicalEvent::moved("/w/a", "/w/c")]);
    }

    #[test]
    fn rename_of_fresh_file_stays_a_create() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::created("/w/download.part"), t0);
        d.push(RawEvent::renamed("/w/download.part", "/w/movie.mkv"), t0 + ms(5));

        let out = d.drain_all(t0 + ms(300));
        assert_eq!(out, vec![LogicalEvent::new(FileEventKind::Created, "/w/movie.mkv")]);
    }

    #[test]
    fn late_idempotent_duplicates_are_dropped() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::created("/w/a.txt"), t0);
        assert_eq!(d.drain_due(t0 + ms(100)).len(), 1);

        d.push(RawEvent::created("/w/a.txt"), t0 + ms(150));
        assert!(d.is_idle());

        // Modified is never suppressed.
        d.push(RawEvent::modified("/w/a.txt"), t0 + ms(160));
        assert_eq!(d.pending_len(), 1);
        assert_eq!(
            d.drain_all(t0 + ms(400)),
            vec![LogicalEvent::new(FileEventKind::Modified, "/w/a.txt")]
        );
    }

    #[test]
    fn recreate_after_delete_is_not_suppressed() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::created("/w/a.txt"), t0);
        d.drain_due(t0 + ms(100));
        d.push(RawEvent::deleted("/w/a.txt"), t0 + ms(110));
        d.drain_due(t0 + ms(210));
        d.push(RawEvent::created("/w/a.txt"), t0 + ms(220));

        assert_eq!(d.pending_len(), 1);
    }

    #[test]
    fn remembered_keys_expire() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::deleted("/w/a.txt"), t0);
        d.drain_due(t0 + ms(100));
        assert_eq!(d.remembered_len(), 1);

        assert_eq!(d.expire(t0 + ms(150)), 0);
        assert_eq!(d.expire(t0 + ms(250)), 1);
        assert_eq!(d.remembered_len(), 0);

        d.push(RawEvent::deleted("/w/a.txt"), t0 + ms(260));
        assert_eq!(d.pending_len(), 1);
    }

    #[test]
    fn capacity_closes_oldest_windows_early() {
        let mut d = Debouncer::new(WINDOW, 2);
        let t0 = Instant::now();

        assert!(d.push(RawEvent::modified("/w/1"), t0).is_empty());
        assert!(d.push(RawEvent::modified("/w/2"), t0 + ms(1)).is_empty());
        let forced = d.push(RawEvent::modified("/w/3"), t0 + ms(2));

        assert_eq!(forced, vec![LogicalEvent::new(FileEventKind::Modified, "/w/1")]);
        assert_eq!(d.pending_len(), 2);
    }

    #[test]
    fn output_follows_window_close_order() {
        let mut d = Debouncer::new(WINDOW, 1024);
        let t0 = Instant::now();

        d.push(RawEvent::modified("/w/a"), t0);
        d.push(RawEvent::modified("/w/b"), t0 + ms(10));
        d.push(RawEvent::modified("/w/a"), t0 + ms(20));

        let out = d.drain_all(t0 + ms(500));
        let paths: Vec<_> = out.iter().map(|e| e.path.clone()).collect();
        assert_eq!(paths, vec![PathBuf::from("/w/b"), PathBuf::from("/w/a")]);
    }
}
