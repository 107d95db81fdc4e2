//! Durable message-to-owner map.
//!
//! Every `put` appends `"<message-uuid> <owner-uuid>"` to the log before the
//! in-memory map changes, so a failed append leaves both sides consistent.
//! Removals touch memory only; [`OwnershipMap::compact`] prunes the log.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use courier_core::{MessageId, NodeId};
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{append_line, rewrite_log, scan_lines, RecoveryReport, StoreError};

#[derive(Debug)]
pub struct OwnershipMap {
    path: PathBuf,
    owners: Mutex<HashMap<MessageId, NodeId>>,
}

impl OwnershipMap {
    /// Creates an empty map logging to `path`. Call [`recover`](Self::recover)
    /// to load an existing log.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owners: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `owner` for `id`, durably first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the append fails; the map is untouched.
    pub fn put(&self, id: MessageId, owner: NodeId) -> Result<(), StoreError> {
        let mut owners = self.owners.lock();
        append_line(&self.path, &format!("{id} {owner}"))?;
        owners.insert(id, owner);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<NodeId> {
        self.owners.lock().get(&id).copied()
    }

    /// Drops the in-memory record. The log line survives until compaction.
    pub fn remove(&self, id: MessageId) -> Option<NodeId> {
        self.owners.lock().remove(&id)
    }

    /// Messages owned by `owner`, sorted by ID.
    #[must_use]
    pub fn owned_by(&self, owner: NodeId) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self
            .owners
            .lock()
            .iter()
            .filter(|(_, o)| **o == owner)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Snapshot of every record, sorted by message ID.
    #[must_use]
    pub fn entries(&self) -> Vec<(MessageId, NodeId)> {
        let mut entries: Vec<_> = self.owners.lock().iter().map(|(m, o)| (*m, *o)).collect();
        entries.sort_unstable();
        entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.owners.lock().is_empty()
    }

    /// Rewrites the log with one line per message still in memory, carrying
    /// its current owner. Returns the number of lines written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the replacement file cannot be written or
    /// renamed; the previous log is left in place.
    pub fn compact(&self) -> Result<usize, StoreError> {
        let owners = self.owners.lock();
        let mut entries: Vec<_> = owners.iter().collect();
        entries.sort_unstable();
        let lines: Vec<String> = entries.iter().map(|(m, o)| format!("{m} {o}")).collect();
        rewrite_log(&self.path, lines.iter().map(String::as_str))?;
        debug!(path = %self.path.display(), records = lines.len(), "compacted ownership log");
        Ok(lines.len())
    }

    /// Replaces the in-memory map with a replay of the log; the last line for
    /// an ID wins. A missing log recovers to an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the log cannot be read, and
    /// [`StoreError::Unrecoverable`] if it has lines but none parse.
    pub fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let mut owners = self.owners.lock();
        let mut replayed = HashMap::new();
        let mut report = RecoveryReport::default();
        scan_lines(&self.path, |offset, line| match parse_record(line) {
            Ok((id, owner)) => {
                replayed.insert(id, owner);
                report.applied += 1;
            }
            Err(reason) => {
                warn!(path = %self.path.display(), offset, %reason, "skipping corrupt ownership record");
                report.skipped += 1;
            }
        })?;
        report.check(&self.path)?;
        *owners = replayed;
        Ok(report)
    }
}

fn parse_record(line: &str) -> Result<(MessageId, NodeId), String> {
    let mut parts = line.split_whitespace();
    let (Some(id), Some(owner), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err("expected two fields".to_string());
    };
    let id = Uuid::try_parse(id).map_err(|e| format!("message id: {e}"))?;
    let owner = Uuid::try_parse(owner).map_err(|e| format!("owner id: {e}"))?;
    Ok((id, owner))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use proptest::prelude::*;
    use tempfile::TempDir;

    use super::*;

    fn map_in(dir: &TempDir) -> OwnershipMap {
        OwnershipMap::new(dir.path().join("owners.log"))
    }

    #[test]
    fn put_get_remove() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let (m, a) = (Uuid::new_v4(), Uuid::new_v4());

        map.put(m, a).unwrap();
        assert_eq!(map.get(m), Some(a));
        assert_eq!(map.remove(m), Some(a));
        assert_eq!(map.get(m), None);

        // removal does not touch the log
        let log = fs::read_to_string(map.path()).unwrap();
        assert_eq!(log, format!("{m} {a}\n"));
    }

    #[test]
    fn failed_append_leaves_memory_unchanged() {
        let dir = TempDir::new().unwrap();
        let map = OwnershipMap::new(dir.path().join("missing-dir").join("owners.log"));
        let m = Uuid::new_v4();

        assert!(matches!(map.put(m, Uuid::new_v4()), Err(StoreError::Io(_))));
        assert_eq!(map.get(m), None);
        assert!(map.is_empty());
    }

    #[test]
    fn recover_replays_last_line_per_message() {
        let dir = TempDir::new().unwrap();
        let (m, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        {
            let map = map_in(&dir);
            map.put(m, a).unwrap();
            map.put(m, b).unwrap();
        }

        let map = map_in(&dir);
        let report = map.recover().unwrap();
        assert_eq!(report, RecoveryReport { applied: 2, skipped: 0 });
        assert_eq!(map.get(m), Some(b));

        // a second pass yields the same state
        map.recover().unwrap();
        assert_eq!(map.entries(), vec![(m, b)]);
    }

    #[test]
    fn recover_skips_corrupt_lines() {
        let dir = TempDir::new().unwrap();
        let (m, a) = (Uuid::new_v4(), Uuid::new_v4());
        let map = map_in(&dir);
        fs::write(map.path(), format!("garbage\n{m} {a}\n{m}\n\n")).unwrap();

        let report = map.recover().unwrap();
        assert_eq!(report, RecoveryReport { applied: 1, skipped: 2 });
        assert_eq!(map.get(m), Some(a));
    }

    #[test]
    fn recover_fails_on_entirely_unreadable_log() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        fs::write(map.path(), "not an ownership log\nat all\n").unwrap();

        assert!(matches!(map.recover(), Err(StoreError::Unrecoverable { .. })));
    }

    #[test]
    fn recover_of_missing_log_is_empty() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        assert_eq!(map.recover().unwrap(), RecoveryReport::default());
        assert!(map.is_empty());
    }

    #[test]
    fn compact_drops_removed_and_superseded_lines() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let (m1, m2, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        map.put(m1, a).unwrap();
        map.put(m2, a).unwrap();
        map.put(m1, b).unwrap();
        map.remove(m2);

        assert_eq!(map.compact().unwrap(), 1);
        assert_eq!(fs::read_to_string(map.path()).unwrap(), format!("{m1} {b}\n"));
        assert!(!dir.path().join("owners.log.temp").exists());
    }

    #[test]
    fn owned_by_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        let map = map_in(&dir);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut mine = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        for id in &mine {
            map.put(*id, a).unwrap();
        }
        map.put(Uuid::new_v4(), b).unwrap();
        mine.sort_unstable();

        assert_eq!(map.owned_by(a), mine);
        assert_eq!(map.len(), 4);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(usize, usize),
        Remove(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..6usize, 0..3usize).prop_map(|(m, o)| Op::Put(m, o)),
            (0..6usize).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn recover_then_compact_preserves_state(ops in proptest::collection::vec(op(), 0..40)) {
            let dir = TempDir::new().unwrap();
            let messages: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
            let nodes: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();

            let map = map_in(&dir);
            for op in &ops {
                match op {
                    Op::Put(m, o) => map.put(messages[*m], nodes[*o]).unwrap(),
                    Op::Remove(m) => { map.remove(messages[*m]); }
                }
            }

            map.recover().unwrap();
            let before = map.entries();
            map.compact().unwrap();

            let replayed = map_in(&dir);
            replayed.recover().unwrap();
            prop_assert_eq!(replayed.entries(), before);
        }
    }
}
