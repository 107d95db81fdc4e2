//! Parse errors for the message long format and the cluster line grammar.

/// Failure to parse a line received from a peer or read back from a log.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The line was empty or whitespace only.
    #[error("empty line")]
    Empty,
    /// No message of the grammar starts with these keywords.
    #[error("unrecognized message: {0:?}")]
    Unrecognized(String),
    /// A labelled field (`STATUS:`, `CONTENTS:`, ...) or positional argument is absent.
    #[error("missing field {0}")]
    MissingField(&'static str),
    /// A token that should be a canonical UUID is not one.
    #[error("invalid uuid {0:?}")]
    InvalidUuid(String),
    /// A bid value is not a signed 32-bit integer.
    #[error("invalid bid value {0:?}")]
    InvalidBid(String),
    /// Message contents are not valid hex.
    #[error("invalid hex contents")]
    InvalidHex,
}
