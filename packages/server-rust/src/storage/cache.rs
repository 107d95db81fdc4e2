//! Hybrid memory/disk message cache.
//!
//! Every added message is appended to the log in long format, so evicting a
//! message only drops its in-memory body; the recorded byte offset is enough
//! to reload it later. Resident bodies are bounded by `load_limit` (the sum of
//! their content sizes).
//!
//! Eviction is least-frequently-referenced: each successful [`get`] bumps a
//! plain counter with no decay, and when room is needed the resident message
//! with the lowest counter goes first. Ties go to the lowest message ID.
//!
//! [`get`]: MessageCache::get

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use courier_core::{Message, MessageId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{append_line, rewrite_log, scan_lines, RecoveryReport, StoreError};

#[derive(Debug)]
struct CacheEntry {
    /// `Some` while the body is resident.
    body: Option<Message>,
    /// Byte offset of the entry's latest line in the log.
    location: u64,
    times_referenced: u64,
    size: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: BTreeMap<MessageId, CacheEntry>,
    current_load: usize,
}

impl CacheState {
    /// Evicts least-referenced resident bodies (never `keep`) until the load
    /// is at most `target`.
    fn make_room(&mut self, target: usize, keep: Option<MessageId>) {
        while self.current_load > target {
            let victim = self
                .entries
                .iter()
                .filter(|(id, e)| e.body.is_some() && Some(**id) != keep)
                .min_by_key(|(_, e)| e.times_referenced)
                .map(|(id, _)| *id);
            let Some(victim) = victim else { break };
            if let Some(entry) = self.entries.get_mut(&victim) {
                entry.body = None;
                self.current_load -= entry.size;
                debug!(message = %victim, references = entry.times_referenced, "evicted message body to disk");
            }
        }
    }
}

#[derive(Debug)]
pub struct MessageCache {
    path: PathBuf,
    load_limit: usize,
    state: Mutex<CacheState>,
}

impl MessageCache {
    /// Creates an empty cache logging to `path`. Call [`recover`](Self::recover)
    /// to load an existing log.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, load_limit: usize) -> Self {
        Self {
            path: path.into(),
            load_limit,
            state: Mutex::new(CacheState::default()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn load_limit(&self) -> usize {
        self.load_limit
    }

    /// Sum of the content sizes of resident bodies.
    #[must_use]
    pub fn current_load(&self) -> usize {
        self.state.lock().current_load
    }

    /// Logs the message and makes it resident, evicting others as needed.
    ///
    /// Adding an ID that is already tracked replaces the earlier body.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Capacity`] if the contents alone exceed the load
    /// limit (nothing is written), or [`StoreError::Io`] if the append fails.
    pub fn add(&self, message: Message) -> Result<(), StoreError> {
        let size = message.size();
        if size > self.load_limit {
            return Err(StoreError::Capacity {
                size,
                limit: self.load_limit,
            });
        }

        let mut state = self.state.lock();
        let location = append_line(&self.path, &message.to_long_format())?;
        if let Some(previous) = state.entries.remove(&message.id) {
            if previous.body.is_some() {
                state.current_load -= previous.size;
            }
        }
        state.make_room(self.load_limit - size, None);
        state.current_load += size;
        state.entries.insert(
            message.id,
            CacheEntry {
                body: Some(message),
                location,
                times_referenced: 0,
                size,
            },
        );
        Ok(())
    }

    /// Returns the message, reloading it from the log if it was evicted, and
    /// counts the reference. `None` if the ID is not tracked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] or [`StoreError::Corrupt`] if the body cannot
    /// be read back from its recorded offset.
    pub fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get(&id) else {
            return Ok(None);
        };

        if entry.body.is_none() {
            let (location, size) = (entry.location, entry.size);
            let message = read_record(&self.path, location, id)?;
            if size <= self.load_limit {
                state.make_room(self.load_limit - size, Some(id));
                state.current_load += size;
                if let Some(entry) = state.entries.get_mut(&id) {
                    entry.body = Some(message);
                }
            } else if let Some(entry) = state.entries.get_mut(&id) {
                // Logged under a larger limit; serve it without making it resident.
                entry.times_referenced += 1;
                return Ok(Some(message));
            }
        }

        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(None);
        };
        entry.times_referenced += 1;
        Ok(entry.body.clone())
    }

    /// Forgets every piece of bookkeeping for `id`. The log keeps the line
    /// until the next compaction.
    pub fn remove(&self, id: MessageId) -> bool {
        let mut state = self.state.lock();
        match state.entries.remove(&id) {
            Some(entry) => {
                if entry.body.is_some() {
                    state.current_load -= entry.size;
                }
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    #[must_use]
    pub fn is_resident(&self, id: MessageId) -> bool {
        self.state
            .lock()
            .entries
            .get(&id)
            .is_some_and(|e| e.body.is_some())
    }

    #[must_use]
    pub fn times_referenced(&self, id: MessageId) -> Option<u64> {
        self.state.lock().entries.get(&id).map(|e| e.times_referenced)
    }

    /// Tracked IDs in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<MessageId> {
        self.state.lock().entries.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Snapshot of every tracked message: straight from memory when all are
    /// resident, otherwise from one sequential pass over the log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the log cannot be read.
    pub fn copy_all_messages(&self) -> Result<Vec<Message>, StoreError> {
        let state = self.state.lock();
        if state.entries.values().all(|e| e.body.is_some()) {
            return Ok(state.entries.values().filter_map(|e| e.body.clone()).collect());
        }

        let mut messages = Vec::with_capacity(state.entries.len());
        scan_lines(&self.path, |offset, line| {
            if let Ok(message) = Message::parse_long_format(line) {
                if state
                    .entries
                    .get(&message.id)
                    .is_some_and(|e| e.location == offset)
                {
                    messages.push(message);
                }
            }
        })?;
        Ok(messages)
    }

    /// Rewrites the log with only the latest line of each tracked ID and
    /// records the new offsets. Returns the number of lines kept.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if reading the old log or writing the new
    /// one fails; in-memory offsets are unchanged then.
    pub fn compact(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let mut kept: Vec<(MessageId, String)> = Vec::with_capacity(state.entries.len());
        let existed = scan_lines(&self.path, |offset, line| {
            match Message::parse_long_format(line) {
                Ok(message) => {
                    if state
                        .entries
                        .get(&message.id)
                        .is_some_and(|e| e.location == offset)
                    {
                        kept.push((message.id, line.to_string()));
                    }
                }
                Err(e) => {
                    warn!(path = %self.path.display(), offset, error = %e, "dropping corrupt cache record");
                }
            }
        })?;
        if !existed {
            return Ok(0);
        }

        let offsets = rewrite_log(&self.path, kept.iter().map(|(_, line)| line.as_str()))?;
        for ((id, _), offset) in kept.iter().zip(offsets) {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.location = offset;
            }
        }
        debug!(path = %self.path.display(), records = kept.len(), "compacted message log");
        Ok(kept.len())
    }

    /// Rebuilds the bookkeeping from the log. Later lines for an ID override
    /// earlier ones; every entry comes back disk-only with a zero reference
    /// count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the log cannot be read, and
    /// [`StoreError::Unrecoverable`] if it has lines but none parse.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut state = self.state.lock();
        let mut entries = BTreeMap::new();
        let mut report = RecoveryReport::default();
        scan_lines(&self.path, |offset, line| match Message::parse_long_format(line) {
            Ok(message) => {
                entries.insert(
                    message.id,
                    CacheEntry {
                        body: None,
                        location: offset,
                        times_referenced: 0,
                        size: message.size(),
                    },
                );
                report.applied += 1;
            }
            Err(e) => {
                warn!(path = %self.path.display(), offset, error = %e, "skipping corrupt cache record");
                report.skipped += 1;
            }
        })?;
        report.check(&self.path)?;
        *state = CacheState {
            entries,
            current_load: 0,
        };
        Ok(report)
    }
}

/// Reads the single long-format line at `offset` and checks it is `expected`.
fn read_record(path: &Path, offset: u64, expected: MessageId) -> Result<Message, StoreError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut line = Vec::new();
    BufReader::new(file).read_until(b'\n', &mut line)?;
    let text = String::from_utf8_lossy(&line);
    let message = Message::parse_long_format(&text).map_err(|e| StoreError::Corrupt {
        offset,
        reason: e.to_string(),
    })?;
    if message.id != expected {
        return Err(StoreError::Corrupt {
            offset,
            reason: format!("expected message {expected}, found {}", message.id),
        });
    }
    Ok(message)
}
