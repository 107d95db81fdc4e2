//! The relayed message value object and its long text format.
//!
//! The long format is used both as the cache log record and as the body of
//! the `MESSAGE` wire line:
//!
//! ```text
//! MESSAGE ID: <uuid> STATUS: <url> DELIVERY: <url> CONTENTS: <hex>
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WireError;

/// Identifier of a relayed message.
pub type MessageId = Uuid;

/// Identifier a node announces to its peers.
pub type NodeId = Uuid;

/// A message accepted for delivery.
///
/// Identity (`PartialEq`, `Hash`) is the `id` alone. Use [`Message::content_eq`]
/// to compare every persisted field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    /// URL notified when the message is created and when it is delivered.
    pub status_url: String,
    /// URL the contents are POSTed to.
    pub delivery_url: String,
    pub contents: Vec<u8>,
    /// Last HTTP status seen on a delivery attempt, 0 before the first attempt.
    /// Not part of the long format.
    #[serde(default)]
    pub last_status: i32,
}

impl Message {
    /// Creates a message with a fresh random ID.
    #[must_use]
    pub fn new(
        status_url: impl Into<String>,
        delivery_url: impl Into<String>,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), status_url, delivery_url, contents)
    }

    #[must_use]
    pub fn with_id(
        id: MessageId,
        status_url: impl Into<String>,
        delivery_url: impl Into<String>,
        contents: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            status_url: status_url.into(),
            delivery_url: delivery_url.into(),
            contents: contents.into(),
            last_status: 0,
        }
    }

    /// Size charged against the cache load limit.
    #[must_use]
    pub fn size(&self) -> usize {
        self.contents.len()
    }

    /// True when ID, both URLs and contents all match byte for byte.
    #[must_use]
    pub fn content_eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.status_url == other.status_url
            && self.delivery_url == other.delivery_url
            && self.contents == other.contents
    }

    /// Encodes the message as a single long-format line (no trailing newline).
    #[must_use]
    pub fn to_long_format(&self) -> String {
        format!(
            "MESSAGE ID: {} STATUS: {} DELIVERY: {} CONTENTS: {}",
            self.id,
            self.status_url,
            self.delivery_url,
            hex::encode_upper(&self.contents)
        )
    }

    /// Parses a long-format line. Keywords and hex digits are case-insensitive.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when a label is missing, the ID is not a UUID,
    /// or the contents are not valid hex.
    pub fn parse_long_format(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(WireError::Empty);
        }
        let upper = line.to_ascii_uppercase();
        if !upper.starts_with("MESSAGE") {
            return Err(WireError::Unrecognized(line.to_string()));
        }
        let fields = labelled_fields(line, &["ID:", " STATUS:", " DELIVERY:", " CONTENTS:"])?;
        Ok(Self::with_id(
            parse_uuid(fields[0])?,
            fields[1],
            fields[2],
            decode_contents(fields[3])?,
        ))
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Message {}

impl Hash for Message {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_long_format())
    }
}

// ---------------------------------------------------------------------------
// Field helpers shared with the wire parser
// ---------------------------------------------------------------------------

/// Splits `line` into the values following each label, in order.
///
/// Labels are matched ASCII case-insensitively and must appear in the given
/// order; each value runs up to the next label (or end of line) and is trimmed.
pub(crate) fn labelled_fields<'a>(
    line: &'a str,
    labels: &[&'static str],
) -> Result<Vec<&'a str>, WireError> {
    // ASCII uppercasing keeps byte offsets identical to `line`.
    let upper = line.to_ascii_uppercase();
    let mut spans = Vec::with_capacity(labels.len());
    let mut from = 0;
    for label in labels {
        let at = upper[from..]
            .find(label)
            .map(|i| i + from)
            .ok_or(WireError::MissingField(label.trim().trim_end_matches(':')))?;
        spans.push((at, at + label.len()));
        from = at + label.len();
    }

    let mut fields = Vec::with_capacity(spans.len());
    for (i, &(_, value_start)) in spans.iter().enumerate() {
        let end = spans.get(i + 1).map_or(line.len(), |&(next, _)| next);
        fields.push(line[value_start..end].trim());
    }
    Ok(fields)
}

/// Only the hyphenated 36-character form appears on the wire and in logs.
pub(crate) fn parse_uuid(token: &str) -> Result<Uuid, WireError> {
    if token.len() != 36 {
        return Err(WireError::InvalidUuid(token.to_string()));
    }
    Uuid::try_parse(token).map_err(|_| WireError::InvalidUuid(token.to_string()))
}

pub(crate) fn decode_contents(hex_text: &str) -> Result<Vec<u8>, WireError> {
    hex::decode(hex_text).map_err(|_| WireError::InvalidHex)
}
