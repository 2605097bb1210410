//! Translation of `notify` events into [`RawEvent`]s.

use std::path::{Path, PathBuf};

use notify::Event;
use notify::event::{EventKind, ModifyKind, RenameMode};

use crate::normalizer::RawEvent;
use crate::types::{is_ignored_path, is_indexable_path, lexical_normalize};

/// Result of converting one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Converted {
    Events(Vec<RawEvent>),
    /// The backend lost events and asks for a rescan.
    Rescan,
}

/// Roots and ignore rules that decide which paths the pipeline keeps.
#[derive(Debug, Clone, Default)]
pub(crate) struct PathScope {
    roots: Vec<PathBuf>,
    ignored: Vec<PathBuf>,
}

impl PathScope {
    pub(crate) fn new(roots: Vec<PathBuf>, ignored: Vec<PathBuf>) -> Self {
        Self { roots, ignored }
    }

    /// Normalizes `path` and returns it when it lies strictly inside a root
    /// and is not ignored.
    pub(crate) fn sanitize(&self, path: &Path) -> Option<PathBuf> {
        if !path.is_absolute() || !is_indexable_path(path) {
            return None;
        }
        let clean = lexical_normalize(path);
        let inside = self
            .roots
            .iter()
            .any(|root| clean.starts_with(root) && clean != *root);
        if !inside || is_ignored_path(&clean, &self.ignored) {
            return None;
        }
        Some(clean)
    }
}

pub(crate) fn convert_event(scope: &PathScope, event: &Event) -> Converted {
    if event.need_rescan() {
        return Converted::Rescan;
    }

    let paths: Vec<Option<PathBuf>> = event.paths.iter().map(|p| scope.sanitize(p)).collect();
    let mut out = Vec::new();

    match event.kind {
        EventKind::Access(_) => {}
        EventKind::Create(_) => out.extend(paths.into_iter().flatten().map(RawEvent::created)),
        EventKind::Remove(_) => out.extend(paths.into_iter().flatten().map(RawEvent::deleted)),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match (paths.first().cloned().flatten(), paths.get(1).cloned().flatten()) {
                (Some(from), Some(to)) => out.push(RawEvent::renamed(from, to)),
                // One side left the watched roots.
                (Some(from), None) => out.push(RawEvent::deleted(from)),
                (None, Some(to)) => out.push(RawEvent::created(to)),
                (None, None) => {}
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            out.extend(paths.into_iter().flatten().map(RawEvent::deleted))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            out.extend(paths.into_iter().flatten().map(RawEvent::created))
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Backends that cannot tell the two sides apart: decide by what
            // is on disk now.
            for path in paths.into_iter().flatten() {
                if path.symlink_metadata().is_ok() {
                    out.push(RawEvent::created(path));
                } else {
                    out.push(RawEvent::deleted(path));
                }
            }
        }
        EventKind::Modify(_) | EventKind::Any => {
            out.extend(paths.into_iter().flatten().map(RawEvent::modified))
        }
        EventKind::Other => {}
    }

    Converted::Events(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, DataChange, Flag, RemoveKind};

    fn scope() -> PathScope {
        PathScope::new(
            vec![PathBuf::from("/w"), PathBuf::from("/x")],
            vec![PathBuf::from("/w/filedex.db")],
        )
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        paths
            .iter()
            .fold(Event::new(kind), |event, path| event.add_path(PathBuf::from(path)))
    }

    fn events(converted: Converted) -> Vec<RawEvent> {
        match converted {
            Converted::Events(events) => events,
            Converted::Rescan => panic!("unexpected rescan"),
        }
    }

    #[test]
    fn basic_kinds_map_through() {
        let s = scope();
        assert_eq!(
            events(convert_event(&s, &event(EventKind::Create(CreateKind::File), &["/w/a"]))),
            vec![RawEvent::created("/w/a")]
        );
        assert_eq!(
            events(convert_event(
                &s,
                &event(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/w/a"])
            )),
            vec![RawEvent::modified("/w/a")]
        );
        assert_eq!(
            events(convert_event(&s, &event(EventKind::Remove(RemoveKind::File), &["/x/b"]))),
            vec![RawEvent::deleted("/x/b")]
        );
        assert!(
            events(convert_event(
                &s,
                &event(EventKind::Access(AccessKind::Any), &["/w/a"])
            ))
            .is_empty()
        );
    }

    #[test]
    fn renames_keep_both_sides_when_inside_roots() {
        let s = scope();
        let both = EventKind::Modify(ModifyKind::Name(RenameMode::Both));

        assert_eq!(
            events(convert_event(&s, &event(both, &["/w/a", "/x/b"]))),
            vec![RawEvent::renamed("/w/a", "/x/b")]
        );
        assert_eq!(
            events(convert_event(&s, &event(both, &["/w/a", "/elsewhere/b"]))),
            vec![RawEvent::deleted("/w/a")]
        );
        assert_eq!(
            events(convert_event(&s, &event(both, &["/tmp/a", "/w/b"]))),
            vec![RawEvent::created("/w/b")]
        );
        assert_eq!(
            events(convert_event(
                &s,
                &event(EventKind::Modify(ModifyKind::Name(RenameMode::From)), &["/w/a"])
            )),
            vec![RawEvent::deleted("/w/a")]
        );
        assert_eq!(
            events(convert_event(
                &s,
                &event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), &["/w/b"])
            )),
            vec![RawEvent::created("/w/b")]
        );
    }

    #[test]
    fn paths_are_normalized_and_scoped() {
        let s = scope();
        assert_eq!(s.sanitize(Path::new("/w/./a/../b")), Some(PathBuf::from("/w/b")));
        assert_eq!(s.sanitize(Path::new("/w/../etc/passwd")), None);
        assert_eq!(s.sanitize(Path::new("/wx/a")), None);
        assert_eq!(s.sanitize(Path::new("relative/a")), None);
        // The root itself is not an indexed entry.
        assert_eq!(s.sanitize(Path::new("/w")), None);
    }

    #[test]
    fn database_files_are_ignored() {
        let s = scope();
        assert_eq!(s.sanitize(Path::new("/w/filedex.db")), None);
        assert_eq!(s.sanitize(Path::new("/w/filedex.db-wal")), None);
        assert_eq!(s.sanitize(Path::new("/w/filedex.db-shm")), None);
        assert!(s.sanitize(Path::new("/w/sub/filedex.db")).is_some());
    }

    #[cfg(unix)]
    #[test]
    fn renaming_to_a_non_utf8_name_reads_as_a_delete() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let s = scope();
        let bad = Path::new("/w").join(OsStr::from_bytes(b"caf\xe9.txt"));
        assert_eq!(s.sanitize(&bad), None);

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/w/a"))
            .add_path(bad);
        assert_eq!(
            events(convert_event(&s, &rename)),
            vec![RawEvent::deleted("/w/a")]
        );
    }

    #[test]
    fn rescan_flag_is_surfaced() {
        let s = scope();
        let flagged = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(convert_event(&s, &flagged), Converted::Rescan);
    }
}
