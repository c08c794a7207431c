//! Recursive filesystem watcher feeding a bounded event queue.
//!
//! notify delivers events on its own thread; they are pushed with
//! `blocking_send`, so a full queue stalls the watcher thread instead of
//! dropping events. The consumer side ([`EventStream`]) joins rename halves
//! and maps everything to [`FileEvent`]s.

use crate::error::Result;
use crate::sync::state::{EventKind, FileEvent};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How long a rename source waits for its destination half. A source with
/// no partner left the watched tree.
pub const RENAME_PAIR_WINDOW: Duration = Duration::from_millis(100);

/// Keeps the OS watch alive; dropping it stops event delivery and closes
/// the queue.
pub struct EventWatcher {
    _watcher: RecommendedWatcher,
}

impl EventWatcher {
    /// Watch `root` recursively. Events arrive on the returned stream in
    /// the order notify reports them.
    pub fn start(root: &Path, capacity: usize) -> Result<(Self, EventStream)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                // an error means the consumer is gone
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => warn!("Watch error: {}", e),
            }
        })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok((Self { _watcher: watcher }, EventStream::new(rx)))
    }
}

/// Consumer end of the watcher queue.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    joiner: RenameJoiner,
    ready: VecDeque<FileEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            rx,
            joiner: RenameJoiner::default(),
            ready: VecDeque::new(),
        }
    }

    /// Next event, or `None` once the watcher is gone and everything held
    /// has been delivered. Cancel safe.
    pub async fn next(&mut self) -> Option<FileEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }
            let received = if self.joiner.is_holding() {
                match tokio::time::timeout(RENAME_PAIR_WINDOW, self.rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        self.ready.extend(self.joiner.flush());
                        continue;
                    }
                }
            } else {
                self.rx.recv().await
            };
            match received {
                Some(event) => self.ready.extend(self.joiner.push(event)),
                None => {
                    self.ready.extend(self.joiner.flush());
                    return self.ready.pop_front();
                }
            }
        }
    }
}

/// Pairs the `From`/`To` halves notify reports for a rename.
///
/// - `From` is held until its `To` arrives, an unrelated event arrives, or
///   the caller flushes it after [`RENAME_PAIR_WINDOW`]. Unpaired, it
///   becomes `Rename(from)`: the path is gone, so the remote copy goes too.
/// - A matching `To` yields the pair; the `Both` that follows it is dropped.
/// - A `To` with no source moved in from outside and becomes `Create(to)`.
#[derive(Debug, Default)]
pub struct RenameJoiner {
    held: Option<(PathBuf, Option<usize>)>,
    /// Tracker of a pair already emitted from its halves
    answered: Option<usize>,
}

impl RenameJoiner {
    pub fn is_holding(&self) -> bool {
        self.held.is_some()
    }

    pub fn push(&mut self, event: Event) -> Vec<FileEvent> {
        let tracker = event.tracker();
        match event.kind {
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                let out = self.flush();
                if let Some(from) = event.paths.into_iter().next() {
                    self.held = Some((from, tracker));
                }
                out
            }
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                let Some(to) = event.paths.into_iter().next() else {
                    return Vec::new();
                };
                match self.held.take() {
                    Some((from, held)) if held == tracker => {
                        self.answered = tracker;
                        rename_pair(from, to)
                    }
                    other => {
                        self.held = other;
                        let mut out = self.flush();
                        out.push(FileEvent::new(EventKind::Create, to));
                        out
                    }
                }
            }
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both))
                if tracker.is_some() && tracker == self.answered =>
            {
                self.answered = None;
                Vec::new()
            }
            notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both))
                if tracker.is_some()
                    && matches!(&self.held, Some((_, held)) if *held == tracker) =>
            {
                self.held = None;
                map_event(event)
            }
            _ => {
                let mut out = self.flush();
                out.extend(map_event(event));
                out
            }
        }
    }

    /// Release a held source as a lone rename.
    pub fn flush(&mut self) -> Vec<FileEvent> {
        match self.held.take() {
            Some((from, _)) => vec![FileEvent::new(EventKind::Rename, from)],
            None => Vec::new(),
        }
    }
}

/// The existing half is seen first and becomes the pending source, the
/// vanished half completes the pair.
fn rename_pair(from: PathBuf, to: PathBuf) -> Vec<FileEvent> {
    vec![
        FileEvent::new(EventKind::Rename, to),
        FileEvent::new(EventKind::Rename, from),
    ]
}

/// Translate one notify event into zero or more [`FileEvent`]s, without
/// rename-half pairing.
///
/// A paired rename (`from`, `to`) becomes `Rename(to)` followed by
/// `Rename(from)`. The unpaired `From`/`To` halves yield nothing here; see
/// [`RenameJoiner`].
pub fn map_event(event: Event) -> Vec<FileEvent> {
    use notify::EventKind as Kind;

    let kind = match event.kind {
        Kind::Create(_) => EventKind::Create,
        Kind::Remove(_) => EventKind::Remove,
        Kind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.into_iter();
            return match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => rename_pair(from, to),
                (Some(only), None) => vec![FileEvent::new(EventKind::Rename, only)],
                _ => Vec::new(),
            };
        }
        Kind::Modify(ModifyKind::Name(RenameMode::From | RenameMode::To)) => return Vec::new(),
        Kind::Modify(ModifyKind::Name(_)) => EventKind::Rename,
        Kind::Modify(_) => EventKind::Write,
        Kind::Access(_) | Kind::Any | Kind::Other => {
            debug!(kind = ?event.kind, "Dropping event");
            return Vec::new();
        }
    };
    event
        .paths
        .into_iter()
        .map(|path| FileEvent::new(kind, path))
        .collect()
}
