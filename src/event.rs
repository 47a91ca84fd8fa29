//! Nostr event model.

use std::time::{SystemTime, UNIX_EPOCH};

use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Profile metadata, used for publisher eligibility checks.
pub const KIND_PROFILE: u32 = 0;
/// Contact list, used for publisher eligibility checks.
pub const KIND_CONTACTS: u32 = 3;
/// Zap request embedded in a payment request and later in its receipt.
pub const KIND_ZAP_REQUEST: u32 = 9734;
/// Zap receipt published by the payee's payment provider.
pub const KIND_ZAP_RECEIPT: u32 = 9735;
/// Parameterized replaceable board configuration, keyed by `d = boardId`.
pub const KIND_BOARD_CONFIG: u32 = 30078;
/// Parameterized replaceable slug reservation, keyed by `d = slug`.
pub const KIND_SLUG_RESERVATION: u32 = 30079;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. The tags this crate reads and writes:
///
/// - `d` – identifier of a replaceable event (board id, slug)
/// - `p` – recipient public key of a zap
/// - `t` – topic marker (`zapboard`, `zapboard-slug`)
/// - `description` – serialized zap request inside a receipt
/// - `board` / `displayName` – correlation data inside a zap request
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Build a tag from its name followed by its values.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Tag(fields.into_iter().map(Into::into).collect())
    }

    /// Tag name (first element), if any.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name, if any.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Look up the first value of the first tag named `name`.
///
/// Empty values count as absent.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.name() == Some(name))
        .and_then(Tag::value)
        .filter(|v| !v.is_empty())
}

/// Signed Nostr event as exchanged with relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "3bf0c63f...",
///   "kind": 30078,
///   "created_at": 1700000000,
///   "tags": [["d", "board"], ["title", "My board"]],
///   "content": "{}",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (x-only, hex).
    pub pubkey: String,
    /// Kind number, e.g. `9735` or `30078`.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tag_value(&self.tags, name)
    }

    /// Verify the event id and its Schnorr signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let hash = event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)?;
        if hex::encode(hash) != self.id {
            return Err(EventError::IdMismatch);
        }
        let sig = Signature::from_slice(&hex::decode(&self.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&self.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest(hash);
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }
}

/// Event body awaiting a signature.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsignedEvent {
    pub kind: u32,
    pub created_at: u64,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl UnsignedEvent {
    /// Create an event body stamped with the current time.
    pub fn new(kind: u32, tags: Vec<Tag>, content: impl Into<String>) -> Self {
        Self {
            kind,
            created_at: unix_now(),
            tags,
            content: content.into(),
        }
    }

    /// Canonical hash for the given author.
    pub fn hash_for(&self, pubkey: &str) -> Result<[u8; 32], EventError> {
        event_hash(pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }
}

/// Errors raised while hashing or verifying an event.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("id mismatch")]
    IdMismatch,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid signature or key: {0}")]
    Secp(#[from] secp256k1::Error),
    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Compute the NIP-01 event hash `sha256([0, pubkey, created_at, kind, tags, content])`.
pub fn event_hash(
    pubkey: &str,
    created_at: u64,
    kind: u32,
    tags: &[Tag],
    content: &str,
) -> Result<[u8; 32], EventError> {
    let arr = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let data = serde_json::to_vec(&arr)?;
    Ok(Sha256::digest(&data).into())
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
