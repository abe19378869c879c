use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::local::PARTIAL_SUFFIX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed { path: String },
    Removed { path: String },
    Moved { from: String, to: String },
}

/// A filesystem event under the local root of one sync config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub config_id: i64,
    pub event: LocalEvent,
}

/// Watches `root` recursively, forwarding events tagged with `config_id`.
/// Dropping the returned watcher stops it.
pub fn watch_root(
    config_id: i64,
    root: &Path,
    tx: mpsc::UnboundedSender<WatchEvent>,
) -> notify::Result<RecommendedWatcher> {
    let watch_root = root.to_path_buf();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for event in map_event(&watch_root, event) {
                let _ = tx.send(WatchEvent { config_id, event });
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    relative_path(root, &event.paths[0]),
                    relative_path(root, &event.paths[1]),
                )
            {
                return vec![LocalEvent::Moved { from, to }];
            }
            event
                .paths
                .iter()
                .filter_map(|path| relative_path(root, path))
                .map(|path| LocalEvent::Changed { path })
                .collect()
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .iter()
            .filter_map(|path| relative_path(root, path))
            .map(|path| LocalEvent::Changed { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .filter_map(|path| relative_path(root, path))
            .map(|path| LocalEvent::Removed { path })
            .collect(),
        _ => Vec::new(),
    }
}

/// Relative path under `root`; in-flight downloads yield nothing.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let rel = relative.to_string_lossy().replace('\\', "/");
    if rel.is_empty() || rel.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    Some(rel)
}

/// Coalesces bursts of events per key: a key becomes ready once `window`
/// passed without a new event for it.
#[derive(Debug)]
pub struct Debouncer<K> {
    window: Duration,
    pending: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> Debouncer<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    pub fn push(&mut self, key: K, now: Instant) {
        self.pending.insert(key, now + self.window);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    pub fn drain_ready(&mut self, now: Instant) -> Vec<K> {
        let ready: Vec<K> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &ready {
            self.pending.remove(key);
        }
        ready
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn maps_modify_event_to_change() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Any,
            )),
            paths: vec![PathBuf::from("/tmp/root/Docs/A.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(root, event),
            vec![LocalEvent::Changed {
                path: "Docs/A.txt".into()
            }]
        );
    }

    #[test]
    fn maps_rename_event_to_move() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Modify(notify::event::ModifyKind::Name(
                notify::event::RenameMode::Both,
            )),
            paths: vec![
                PathBuf::from("/tmp/root/A.txt"),
                PathBuf::from("/tmp/root/B.txt"),
            ],
            attrs: Default::default(),
        };
        assert_eq!(
            map_event(root, event),
            vec![LocalEvent::Moved {
                from: "A.txt".into(),
                to: "B.txt".into()
            }]
        );
    }

    #[test]
    fn partial_downloads_are_not_reported() {
        let root = Path::new("/tmp/root");
        let event = Event {
            kind: EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/tmp/root/.a.txt.strata-part")],
            attrs: Default::default(),
        };
        assert!(map_event(root, event).is_empty());
    }

    #[test]
    fn debouncer_waits_for_quiet_period() {
        let start = Instant::now();
        let window = Duration::from_millis(500);
        let mut debouncer = Debouncer::new(window);
        debouncer.push(1, start);
        debouncer.push(1, start + Duration::from_millis(300));
        debouncer.push(2, start + Duration::from_millis(100));

        assert!(debouncer.drain_ready(start + Duration::from_millis(550)).is_empty());
        assert_eq!(
            debouncer.next_deadline(),
            Some(start + Duration::from_millis(600))
        );
        assert_eq!(
            debouncer.drain_ready(start + Duration::from_millis(650)),
            vec![2]
        );
        assert_eq!(
            debouncer.drain_ready(start + Duration::from_millis(800)),
            vec![1]
        );
        assert!(debouncer.is_empty());
    }
}
