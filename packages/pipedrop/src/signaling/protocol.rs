//! Signaling Protocol Types
//!
//! JSON records exchanged over the signaling WebSocket. Every frame carries a
//! `type` tag. Server frames are typed; peer frames are addressed with `to`
//! and forwarded as sent, with only `from` stamped by the relay.

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;
use std::fmt;

/// Identity assigned to a live signaling connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `User-NNNNN` from the remote port of the connection.
    pub fn from_port(port: u16) -> Self {
        Self(format!("User-{port:05}"))
    }

    /// `User-NNNNN` from a random token, used when the port-derived name is taken.
    pub fn random() -> Self {
        let n: u32 = rand::rng().random_range(0..100_000);
        Self(format!("User-{n:05}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ClientIdentity {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Messages the relay itself originates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Sent once, right after registration
    Welcome { id: ClientIdentity },
    /// Current set of connected identities
    List { users: Vec<ClientIdentity> },
    /// A transfer both sides took part in has been fully delivered
    Complete,
}

/// A client-to-client frame (`offer`, `accept`, or anything else carrying a
/// `to`). Only `from` is rewritten on the way through; every other field,
/// including its JSON type, reaches the addressee as sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerMessage(Map<String, Value>);

impl PeerMessage {
    /// Parse one text frame. Anything but a JSON object is rejected.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Addressee, when `to` is present and a string.
    pub fn recipient(&self) -> Option<&str> {
        self.0.get("to").and_then(Value::as_str)
    }

    /// Overwrite `from` with the relaying connection's identity.
    pub fn stamped(mut self, sender: &ClientIdentity) -> Self {
        self.0
            .insert("from".to_string(), Value::String(sender.as_str().to_string()));
        self
    }
}

/// One entry on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Control(ControlMessage),
    Peer(PeerMessage),
}

impl From<ControlMessage> for Outbound {
    fn from(msg: ControlMessage) -> Self {
        Outbound::Control(msg)
    }
}

impl From<PeerMessage> for Outbound {
    fn from(msg: PeerMessage) -> Self {
        Outbound::Peer(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn welcome_wire_format() {
        let msg = ControlMessage::Welcome {
            id: ClientIdentity::new("User-12345"),
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "welcome", "id": "User-12345"})
        );
    }

    #[test]
    fn list_wire_format() {
        let msg = ControlMessage::List {
            users: vec!["User-00001".into(), "User-00002".into()],
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "list", "users": ["User-00001", "User-00002"]})
        );
    }

    #[test]
    fn complete_has_only_a_type() {
        assert_eq!(
            serde_json::to_value(ControlMessage::Complete).unwrap(),
            json!({"type": "complete"})
        );
        let parsed: ControlMessage = serde_json::from_str(r#"{"type":"complete"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::Complete);
    }

    #[test]
    fn peer_message_keeps_fields_as_sent() {
        let msg = PeerMessage::parse(
            r#"{"type":"offer","to":"User-00002","name":"x.txt","size":"1024","mime":"text/plain"}"#,
        )
        .unwrap();
        assert_eq!(msg.recipient(), Some("User-00002"));

        let stamped = msg.stamped(&"User-00001".into());
        assert_eq!(
            serde_json::to_value(Outbound::from(stamped)).unwrap(),
            json!({
                "type": "offer",
                "to": "User-00002",
                "from": "User-00001",
                "name": "x.txt",
                "size": "1024",
                "mime": "text/plain"
            })
        );
    }

    #[test]
    fn stamping_overwrites_spoofed_sender() {
        let msg =
            PeerMessage::parse(r#"{"type":"accept","to":"User-00001","from":"User-99999"}"#)
                .unwrap();
        let stamped = msg.stamped(&"User-00002".into());
        assert_eq!(
            serde_json::to_value(&stamped).unwrap()["from"],
            json!("User-00002")
        );
    }

    #[test]
    fn recipient_requires_string_to() {
        let unaddressed = PeerMessage::parse(r#"{"type":"complete"}"#).unwrap();
        assert!(unaddressed.recipient().is_none());
        let numeric = PeerMessage::parse(r#"{"type":"offer","to":42}"#).unwrap();
        assert!(numeric.recipient().is_none());
    }

    #[test]
    fn parse_rejects_non_objects() {
        assert!(PeerMessage::parse("not json").is_err());
        assert!(PeerMessage::parse(r#"["offer"]"#).is_err());
        assert!(PeerMessage::parse(r#""offer""#).is_err());
    }

    #[test]
    fn outbound_control_keeps_type_tag() {
        assert_eq!(
            serde_json::to_value(Outbound::from(ControlMessage::Complete)).unwrap(),
            json!({"type": "complete"})
        );
    }

    #[test]
    fn identity_formats() {
        assert_eq!(ClientIdentity::from_port(443).as_str(), "User-00443");
        assert_eq!(ClientIdentity::from_port(54321).as_str(), "User-54321");
        let random = ClientIdentity::random();
        assert!(random.as_str().starts_with("User-"));
        assert_eq!(random.as_str().len(), "User-".len() + 5);
    }
}
