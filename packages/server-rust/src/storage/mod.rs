//! Durable message storage.
//!
//! Two independent append-only logs back the node:
//! - [`OwnershipMap`]: message ID to owning node ID.
//! - [`MessageCache`]: message bodies, bounded in memory, reloadable by offset.
//!
//! [`MessageLog`] combines them behind the [`MessageStore`] trait that the
//! protocol state machine and the election engine are written against.

pub mod cache;
pub mod message_log;
pub mod ownership;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use courier_core::{Message, MessageId, NodeId};

pub use cache::MessageCache;
pub use message_log::MessageLog;
pub use ownership::OwnershipMap;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a durable store operation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// A single message is larger than the cache load limit.
    #[error("message of {size} bytes exceeds cache load limit of {limit} bytes")]
    Capacity { size: usize, limit: usize },
    /// A record could not be loaded from its recorded byte offset.
    #[error("corrupt record at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
    /// Not a single line of a non-empty log could be parsed.
    #[error("log {} is unreadable", path.display())]
    Unrecoverable { path: PathBuf },
}

/// Outcome of replaying a log at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Lines applied to the in-memory state.
    pub applied: usize,
    /// Corrupt lines skipped with a warning.
    pub skipped: usize,
}

impl RecoveryReport {
    /// Fails when the log had content and none of it was usable.
    pub(crate) fn check(self, path: &Path) -> Result<Self, StoreError> {
        if self.applied == 0 && self.skipped > 0 {
            return Err(StoreError::Unrecoverable {
                path: path.to_path_buf(),
            });
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// MessageStore
// ---------------------------------------------------------------------------

/// Shared message and ownership state consulted by every connection.
///
/// Implementations synchronize internally; every method may be called from
/// any connection task.
pub trait MessageStore: Send + Sync {
    /// Durably caches a message body. A body already tracked under the same
    /// ID is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Capacity`] or [`StoreError::Io`] when the body
    /// could not be cached.
    fn record_message(&self, message: Message) -> Result<(), StoreError>;

    /// Returns the body, loading it from disk when it is not resident.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a disk-resident record cannot be read back.
    fn message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    fn contains_message(&self, id: MessageId) -> bool;

    /// Snapshot of every cached message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] when the fallback file scan fails.
    fn all_messages(&self) -> Result<Vec<Message>, StoreError>;

    /// Drops the body and the ownership record of a delivered message.
    fn forget(&self, id: MessageId);

    /// Writes an ownership record through the durable log.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the append failed; memory is unchanged then.
    fn set_owner(&self, id: MessageId, owner: NodeId) -> Result<(), StoreError>;

    fn owner_of(&self, id: MessageId) -> Option<NodeId>;

    /// IDs of every message currently owned by `owner`, sorted.
    fn messages_owned_by(&self, owner: NodeId) -> Vec<MessageId>;

    /// Every ownership record as `(message, owner)`, sorted by message ID.
    fn ownership(&self) -> Vec<(MessageId, NodeId)>;

    fn message_count(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Log file helpers
// ---------------------------------------------------------------------------

/// Appends `line` plus a newline, returning the byte offset the line starts at.
pub(crate) fn append_line(path: &Path, line: &str) -> io::Result<u64> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let offset = file.metadata()?.len();
    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');
    file.write_all(record.as_bytes())?;
    file.flush()?;
    Ok(offset)
}

/// Calls `visit(offset, line)` for every non-empty line of the log.
///
/// Returns `false` without visiting anything when the file does not exist.
pub(crate) fn scan_lines(path: &Path, mut visit: impl FnMut(u64, &str)) -> io::Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    let mut offset = 0u64;
    for chunk in BufReader::new(file).split(b'\n') {
        let chunk = chunk?;
        let line = String::from_utf8_lossy(&chunk);
        let line = line.trim_end_matches('\r');
        if !line.trim().is_empty() {
            visit(offset, line);
        }
        offset += chunk.len() as u64 + 1;
    }
    Ok(true)
}

/// Replaces `path` with `lines`, going through a `.temp` sibling and a rename.
///
/// Returns the byte offset of each written line.
pub(crate) fn rewrite_log<'a>(
    path: &Path,
    lines: impl IntoIterator<Item = &'a str>,
) -> io::Result<Vec<u64>> {
    let temp = temp_path(path);
    let mut offsets = Vec::new();
    {
        let mut writer = BufWriter::new(File::create(&temp)?);
        let mut offset = 0u64;
        for line in lines {
            offsets.push(offset);
            writer.write_all(line.as_bytes())?;
            writer.write_all(b"\n")?;
            offset += line.len() as u64 + 1;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&temp, path)?;
    Ok(offsets)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".temp");
    PathBuf::from(name)
}
