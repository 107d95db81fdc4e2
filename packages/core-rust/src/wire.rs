//! Cluster wire grammar.
//!
//! Every peer line parses into one [`WireMessage`] variant; `Display` writes
//! the canonical line back. Keywords match case-insensitively, arguments
//! (UUIDs, URLs) keep their case.

use std::fmt;

use crate::error::WireError;
use crate::message::{decode_contents, labelled_fields, parse_uuid, Message, MessageId, NodeId};

/// One line of the cluster protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// `START [<uuid>]`: opens a session, carrying the sender's node ID.
    Start(Option<NodeId>),
    /// `NEW NODE <uuid>`: a freshly started node asks for every known message.
    NewNode(NodeId),
    /// `NEW NODE CONFIRMED <uuid>`
    NewNodeConfirmed(NodeId),
    /// `NEW NODE OVER`
    NewNodeOver,
    /// `OWNERS`: opens the ownership stream sent during catch-up.
    Owners,
    /// `OWNER <message-uuid> <owner-uuid>`
    Owner { message: MessageId, owner: NodeId },
    /// `OWNERS END`
    OwnersEnd,
    /// `HEART BEAT`
    HeartBeat,
    /// `HEART BEAT START`
    HeartBeatStart,
    /// `DEAD NODE <uuid>`
    DeadNode(NodeId),
    /// `AUCTION <uuid-of-node>`
    Auction(NodeId),
    /// `AUCTION OVER`
    AuctionOver,
    /// `BID <message-uuid> <int32>`
    Bid { id: MessageId, value: i32 },
    /// `GET MESSAGE <message-uuid>`
    GetMessage(MessageId),
    /// `MESSAGE ID: ... CONTENTS: ...` (long format).
    Message(Message),
    /// `MESSAGE NOT FOUND`
    MessageNotFound,
    /// `MESSAGE CREATED <uuid> STATUS: <url> DELIVERY: <url> CONTENTS: <hex>`
    MessageCreated(Message),
    /// `MESSAGE DELIVERED <message-uuid>`
    MessageDelivered(MessageId),
    /// `ERROR`
    Error,
    /// `TIMEOUT`
    Timeout,
}

impl WireMessage {
    /// Parses one line (without its terminator).
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Unrecognized`] for lines outside the grammar and a
    /// more specific variant when a known message carries a malformed argument.
    pub fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(WireError::Empty);
        }
        let kw = |i: usize, word: &str| tokens.get(i).is_some_and(|t| t.eq_ignore_ascii_case(word));
        let exact = |n: usize| tokens.len() == n;
        let arg = |i: usize, name: &'static str| -> Result<&str, WireError> {
            tokens.get(i).copied().ok_or(WireError::MissingField(name))
        };

        let parsed = if kw(0, "START") && tokens.len() <= 2 {
            Self::Start(tokens.get(1).map(|t| parse_uuid(t)).transpose()?)
        } else if kw(0, "NEW") && kw(1, "NODE") && kw(2, "CONFIRMED") {
            Self::NewNodeConfirmed(parse_uuid(arg(3, "node")?)?)
        } else if kw(0, "NEW") && kw(1, "NODE") && kw(2, "OVER") && exact(3) {
            Self::NewNodeOver
        } else if kw(0, "NEW") && kw(1, "NODE") {
            Self::NewNode(parse_uuid(arg(2, "node")?)?)
        } else if kw(0, "NEW") && kw(1, "MESSAGE") {
            Self::MessageCreated(parse_created(remainder(line, 2))?)
        } else if kw(0, "OWNERS") && kw(1, "END") && exact(2) {
            Self::OwnersEnd
        } else if kw(0, "OWNERS") && exact(1) {
            Self::Owners
        } else if kw(0, "OWNER") {
            Self::Owner {
                message: parse_uuid(arg(1, "message")?)?,
                owner: parse_uuid(arg(2, "owner")?)?,
            }
        } else if kw(0, "HEART") && kw(1, "BEAT") && kw(2, "START") && exact(3) {
            Self::HeartBeatStart
        } else if kw(0, "HEART") && kw(1, "BEAT") && exact(2) {
            Self::HeartBeat
        } else if kw(0, "DEAD") && kw(1, "NODE") {
            Self::DeadNode(parse_uuid(arg(2, "node")?)?)
        } else if kw(0, "AUCTION") && kw(1, "OVER") && exact(2) {
            Self::AuctionOver
        } else if kw(0, "AUCTION") {
            Self::Auction(parse_uuid(arg(1, "node")?)?)
        } else if kw(0, "BID") {
            let value = arg(2, "value")?;
            Self::Bid {
                id: parse_uuid(arg(1, "message")?)?,
                value: value
                    .parse()
                    .map_err(|_| WireError::InvalidBid(value.to_string()))?,
            }
        } else if kw(0, "GET") && kw(1, "MESSAGE") {
            Self::GetMessage(parse_uuid(arg(2, "message")?)?)
        } else if kw(0, "MESSAGE") && kw(1, "NOT") && kw(2, "FOUND") && exact(3) {
            Self::MessageNotFound
        } else if kw(0, "MESSAGE") && kw(1, "CREATED") {
            Self::MessageCreated(parse_created(remainder(line, 2))?)
        } else if kw(0, "MESSAGE") && kw(1, "DELIVERED") {
            Self::MessageDelivered(parse_uuid(arg(2, "message")?)?)
        } else if kw(0, "MESSAGE") && tokens.get(1).is_some_and(|t| t.eq_ignore_ascii_case("ID:")) {
            Self::Message(Message::parse_long_format(line)?)
        } else if kw(0, "ERROR") && exact(1) {
            Self::Error
        } else if kw(0, "TIMEOUT") && exact(1) {
            Self::Timeout
        } else {
            return Err(WireError::Unrecognized(line.to_string()));
        };
        Ok(parsed)
    }

    /// Leading keyword(s), for logs and metric labels.
    #[must_use]
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Start(_) => "START",
            Self::NewNode(_) => "NEW NODE",
            Self::NewNodeConfirmed(_) => "NEW NODE CONFIRMED",
            Self::NewNodeOver => "NEW NODE OVER",
            Self::Owners => "OWNERS",
            Self::Owner { .. } => "OWNER",
            Self::OwnersEnd => "OWNERS END",
            Self::HeartBeat => "HEART BEAT",
            Self::HeartBeatStart => "HEART BEAT START",
            Self::DeadNode(_) => "DEAD NODE",
            Self::Auction(_) => "AUCTION",
            Self::AuctionOver => "AUCTION OVER",
            Self::Bid { .. } => "BID",
            Self::GetMessage(_) => "GET MESSAGE",
            Self::Message(_) => "MESSAGE",
            Self::MessageNotFound => "MESSAGE NOT FOUND",
            Self::MessageCreated(_) => "MESSAGE CREATED",
            Self::MessageDelivered(_) => "MESSAGE DELIVERED",
            Self::Error => "ERROR",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(Some(node)) => write!(f, "START {node}"),
            Self::Start(None) => f.write_str("START"),
            Self::NewNode(node) => write!(f, "NEW NODE {node}"),
            Self::NewNodeConfirmed(node) => write!(f, "NEW NODE CONFIRMED {node}"),
            Self::DeadNode(node) => write!(f, "DEAD NODE {node}"),
            Self::Auction(node) => write!(f, "AUCTION {node}"),
            Self::Bid { id, value } => write!(f, "BID {id} {value}"),
            Self::GetMessage(id) => write!(f, "GET MESSAGE {id}"),
            Self::Owner { message, owner } => write!(f, "OWNER {message} {owner}"),
            Self::MessageDelivered(id) => write!(f, "MESSAGE DELIVERED {id}"),
            Self::Message(message) => f.write_str(&message.to_long_format()),
            Self::MessageCreated(m) => write!(
                f,
                "MESSAGE CREATED {} STATUS: {} DELIVERY: {} CONTENTS: {}",
                m.id,
                m.status_url,
                m.delivery_url,
                hex::encode_upper(&m.contents)
            ),
            other => f.write_str(other.keyword()),
        }
    }
}

/// Drops the first `n` whitespace-separated tokens of `line`.
fn remainder(line: &str, n: usize) -> &str {
    let mut rest = line.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = rest[end..].trim_start();
    }
    rest
}

/// Parses `<uuid> STATUS: .. DELIVERY: .. CONTENTS: <hex>` or the short
/// `<uuid> CONTENTS: <hex>` form.
fn parse_created(rest: &str) -> Result<Message, WireError> {
    let id_token = rest
        .split_whitespace()
        .next()
        .ok_or(WireError::MissingField("message"))?;
    let id = parse_uuid(id_token)?;
    let fields = remainder(rest, 1);
    if fields.to_ascii_uppercase().starts_with("STATUS:") {
        let values = labelled_fields(fields, &["STATUS:", " DELIVERY:", " CONTENTS:"])?;
        Ok(Message::with_id(id, values[0], values[1], decode_contents(values[2])?))
    } else {
        let values = labelled_fields(fields, &["CONTENTS:"])?;
        Ok(Message::with_id(id, "", "", decode_contents(values[0])?))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn node() -> Uuid {
        Uuid::parse_str("0e9b4d8c-1f2a-4b3c-8d4e-5f6a7b8c9d0e").unwrap()
    }

    #[test]
    fn parses_fixed_lines_case_insensitively() {
        assert_eq!(WireMessage::parse("start").unwrap(), WireMessage::Start(None));
        assert_eq!(WireMessage::parse("Heart Beat").unwrap(), WireMessage::HeartBeat);
        assert_eq!(
            WireMessage::parse("HEART BEAT START").unwrap(),
            WireMessage::HeartBeatStart
        );
        assert_eq!(WireMessage::parse("auction over").unwrap(), WireMessage::AuctionOver);
        assert_eq!(WireMessage::parse("NEW NODE OVER").unwrap(), WireMessage::NewNodeOver);
        assert_eq!(
            WireMessage::parse("MESSAGE NOT FOUND").unwrap(),
            WireMessage::MessageNotFound
        );
        assert_eq!(WireMessage::parse("  ERROR ").unwrap(), WireMessage::Error);
        assert_eq!(WireMessage::parse("TIMEOUT").unwrap(), WireMessage::Timeout);
    }

    #[test]
    fn parses_uuid_arguments() {
        let id = node();
        assert_eq!(
            WireMessage::parse(&format!("START {id}")).unwrap(),
            WireMessage::Start(Some(id))
        );
        assert_eq!(
            WireMessage::parse(&format!("new node {id}")).unwrap(),
            WireMessage::NewNode(id)
        );
        assert_eq!(
            WireMessage::parse(&format!("NEW NODE CONFIRMED {id}")).unwrap(),
            WireMessage::NewNodeConfirmed(id)
        );
        assert_eq!(
            WireMessage::parse(&format!("DEAD NODE {id}")).unwrap(),
            WireMessage::DeadNode(id)
        );
        assert_eq!(
            WireMessage::parse(&format!("AUCTION {id}")).unwrap(),
            WireMessage::Auction(id)
        );
        assert_eq!(
            WireMessage::parse(&format!("GET MESSAGE {id}")).unwrap(),
            WireMessage::GetMessage(id)
        );
        assert_eq!(
            WireMessage::parse(&format!("MESSAGE DELIVERED {id}")).unwrap(),
            WireMessage::MessageDelivered(id)
        );
    }

    #[test]
    fn parses_ownership_stream() {
        let (message, owner) = (node(), Uuid::from_u128(1));
        assert_eq!(WireMessage::parse("owners").unwrap(), WireMessage::Owners);
        assert_eq!(WireMessage::parse("OWNERS END").unwrap(), WireMessage::OwnersEnd);
        assert_eq!(
            WireMessage::parse(&format!("OWNER {message} {owner}")).unwrap(),
            WireMessage::Owner { message, owner }
        );
        assert_eq!(
            WireMessage::parse(&format!("OWNER {message}")),
            Err(WireError::MissingField("owner"))
        );
    }

    #[test]
    fn parses_negative_and_extreme_bids() {
        let id = node();
        assert_eq!(
            WireMessage::parse(&format!("BID {id} -2147483648")).unwrap(),
            WireMessage::Bid { id, value: i32::MIN }
        );
        assert_eq!(
            WireMessage::parse(&format!("BID {id} 2147483648")),
            Err(WireError::InvalidBid("2147483648".to_string()))
        );
        assert_eq!(
            WireMessage::parse(&format!("BID {id}")),
            Err(WireError::MissingField("value"))
        );
    }

    #[test]
    fn message_created_keeps_url_case() {
        let message = Message::new("http://Origin/Status", "http://Target/IN", b"hi".to_vec());
        let line = WireMessage::MessageCreated(message.clone()).to_string();
        match WireMessage::parse(&line).unwrap() {
            WireMessage::MessageCreated(parsed) => assert!(parsed.content_eq(&message)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_created_short_form_and_alias() {
        let id = node();
        let short = WireMessage::parse(&format!("MESSAGE CREATED {id} CONTENTS: 6869")).unwrap();
        let alias = WireMessage::parse(&format!("NEW MESSAGE {id} contents: 6869")).unwrap();
        let expected = Message::with_id(id, "", "", b"hi".to_vec());
        for parsed in [short, alias] {
            match parsed {
                WireMessage::MessageCreated(m) => assert!(m.content_eq(&expected)),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn message_line_uses_long_format() {
        let message = Message::new("s", "d", vec![0xde, 0xad]);
        let line = WireMessage::Message(message.clone()).to_string();
        assert!(line.starts_with("MESSAGE ID: "));
        assert!(line.ends_with("CONTENTS: DEAD"));
        assert_eq!(WireMessage::parse(&line).unwrap(), WireMessage::Message(message));
    }

    #[test]
    fn display_then_parse_is_stable_for_every_variant() {
        let id = node();
        let all = vec![
            WireMessage::Start(Some(id)),
            WireMessage::Start(None),
            WireMessage::NewNode(id),
            WireMessage::NewNodeConfirmed(id),
            WireMessage::NewNodeOver,
            WireMessage::Owners,
            WireMessage::Owner {
                message: id,
                owner: Uuid::from_u128(7),
            },
            WireMessage::OwnersEnd,
            WireMessage::HeartBeat,
            WireMessage::HeartBeatStart,
            WireMessage::DeadNode(id),
            WireMessage::Auction(id),
            WireMessage::AuctionOver,
            WireMessage::Bid { id, value: 42 },
            WireMessage::GetMessage(id),
            WireMessage::MessageNotFound,
            WireMessage::MessageDelivered(id),
            WireMessage::Error,
            WireMessage::Timeout,
        ];
        for msg in all {
            assert_eq!(WireMessage::parse(&msg.to_string()).unwrap(), msg);
        }
    }

    #[test]
    fn rejects_unknown_and_malformed_lines() {
        assert_eq!(WireMessage::parse("   "), Err(WireError::Empty));
        assert!(matches!(
            WireMessage::parse("HELLO THERE"),
            Err(WireError::Unrecognized(_))
        ));
        assert!(matches!(
            WireMessage::parse("HEART BEAT NOW PLEASE"),
            Err(WireError::Unrecognized(_))
        ));
        assert_eq!(
            WireMessage::parse("AUCTION not-a-uuid"),
            Err(WireError::InvalidUuid("not-a-uuid".to_string()))
        );
        assert_eq!(
            WireMessage::parse("GET MESSAGE"),
            Err(WireError::MissingField("message"))
        );
    }
}
