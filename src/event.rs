//! Nostr event model.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind used by NIP-09 deletion requests.
pub const KIND_DELETION: u32 = 5;

/// Wrapper for a Nostr tag expressed as an array of strings.
///
/// Tags appear as small arrays where the first element denotes the type and the
/// following elements hold data. Job listings use, among others:
///
/// - `d` – slot identifier for addressable listings
/// - `title`, `company`, `location` – free-text attributes
/// - `skill` – one tag per required skill
/// - `salary` – `["salary", min, max, currency, period]`
///
/// Each tag is stored verbatim so uncommon or custom tags are preserved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tag(pub Vec<String>);

impl Tag {
    /// Tag name, e.g. `"skill"`.
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// First value after the name.
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// Core Nostr event as delivered by relays.
///
/// ```json
/// {
///   "id": "aa11",
///   "pubkey": "a1b2...",
///   "kind": 9993,
///   "created_at": 1700000000,
///   "tags": [["d", "rust-dev"], ["skill", "Rust"]],
///   "content": "We are hiring",
///   "sig": "deadbeef"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Event identifier (hex of SHA-256 hash).
    pub id: String,
    /// Author public key (hex).
    pub pubkey: String,
    /// Kind number, e.g. `9993` for job listings.
    pub kind: u32,
    /// Unix timestamp of creation.
    pub created_at: u64,
    /// Arbitrary tags such as `d` (identifier) or `skill`.
    pub tags: Vec<Tag>,
    /// Event content body.
    pub content: String,
    /// Schnorr signature over the event hash.
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All tags named `name`.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Tag> + 'a {
        self.tags.iter().filter(move |t| t.name() == Some(name))
    }
}

/// Recompute the Nostr event hash from its fields.
pub fn event_hash(ev: &Event) -> Result<[u8; 32]> {
    let arr = serde_json::json!([0, ev.pubkey, ev.created_at, ev.kind, ev.tags, ev.content]);
    let data = serde_json::to_vec(&arr)?;
    let hash = Sha256::digest(&data);
    Ok(hash.into())
}

/// Verify an event's ID and Schnorr signature.
pub fn verify_event(ev: &Event) -> Result<()> {
    let hash = event_hash(ev)?;
    let calc_id = hex::encode(hash);
    if calc_id != ev.id {
        return Err(anyhow!("id mismatch"));
    }
    let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
    let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest_slice(&hash)?;
    secp.verify_schnorr(&sig, &msg, &pk)?;
    Ok(())
}
