//! NIP-01: Basic protocol flow description.
//!
//! Records exchanged with relays are called events. This module holds:
//! - the signed [`Event`] and the unsigned [`EventTemplate`]
//! - serialization for hashing (`[0, pubkey, created_at, kind, tags, content]`)
//! - Schnorr signing and verification over secp256k1
//! - the kind constants the client works with
//!
//! Events are immutable once signed. Updates are expressed as new events that
//! supersede older ones by kind and `created_at`.

use bitcoin::hashes::{Hash, sha256};
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::{Keypair, Message, SecretKey, XOnlyPublicKey, schnorr};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during NIP-01 operations.
#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("verification error: {0}")]
    Verification(String),

    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
}

/// User metadata (profile).
pub const KIND_METADATA: u16 = 0;
/// Short text note. Feed posts and comments.
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;
/// Repost (NIP-18).
pub const KIND_REPOST: u16 = 6;
/// Reaction (NIP-25). A like is a reaction.
pub const KIND_REACTION: u16 = 7;

/// A signed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// 32-bytes lowercase hex-encoded sha256 of the serialized event data
    pub id: String,
    /// 32-bytes lowercase hex-encoded public key of the event creator
    pub pubkey: String,
    /// Unix timestamp in seconds, asserted by the author
    pub created_at: u64,
    /// Event kind
    pub kind: u16,
    /// Ordered tags, each an array of strings whose first element is the name
    pub tags: Vec<Vec<String>>,
    /// Arbitrary string content
    pub content: String,
    /// 64-bytes lowercase hex signature
    pub sig: String,
}

impl Event {
    /// Value of the first tag named `name`, i.e. `tag[1]`.
    pub fn first_tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// All values of tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(String::as_str) == Some(name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// Whether a tag `[name, value, ..]` is present.
    pub fn has_tag(&self, name: &str, value: &str) -> bool {
        self.tag_values(name).any(|v| v == value)
    }
}

/// A template for creating events. The pubkey comes from the signing key.
///
/// ```
/// use nostr::{EventTemplate, KIND_SHORT_TEXT_NOTE};
///
/// let template = EventTemplate::new(KIND_SHORT_TEXT_NOTE, "Morning 5k done")
///     .tag(["t", "runstr"]);
/// assert_eq!(template.tags, vec![vec!["t".to_string(), "runstr".to_string()]]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl EventTemplate {
    /// Create a template stamped with the current time.
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            created_at: unix_now(),
            kind,
            tags: Vec::new(),
            content: content.into(),
        }
    }

    /// Append one tag.
    pub fn tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    /// Append several tags.
    pub fn tags(mut self, tags: Vec<Vec<String>>) -> Self {
        self.tags.extend(tags);
        self
    }

    /// Override the timestamp.
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Generate a random 32-byte secret key.
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Get the x-only public key as hex from a secret key.
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key)
        .map_err(|e| Nip01Error::InvalidSecretKey(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}

/// Serialize event fields for hashing.
fn serialize_for_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, Nip01Error> {
    serde_json::to_string(&(0, pubkey, created_at, kind, tags, content))
        .map_err(|e| Nip01Error::Serialization(e.to_string()))
}

fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<[u8; 32], Nip01Error> {
    let serialized = serialize_for_id(pubkey, created_at, kind, tags, content)?;
    Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
}

fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

/// Sign a template with a secret key, producing a complete signed event.
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = keypair.x_only_public_key();
    let pubkey = hex::encode(xonly.serialize());

    let digest = compute_id(
        &pubkey,
        template.created_at,
        template.kind,
        &template.tags,
        &template.content,
    )?;
    let message = Message::from_digest(digest);
    let sig = secp.sign_schnorr_no_aux_rand(&message, &keypair);

    Ok(Event {
        id: hex::encode(digest),
        pubkey,
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
        sig: hex::encode(sig.serialize()),
    })
}

/// Verify an event's id and signature.
///
/// Returns `Ok(false)` for a well-formed event that does not verify.
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !is_lower_hex(&event.id, 64) || !is_lower_hex(&event.pubkey, 64) || !is_lower_hex(&event.sig, 128) {
        return Ok(false);
    }

    let digest = compute_id(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    )?;
    if hex::encode(digest) != event.id {
        return Ok(false);
    }

    let sig_bytes = hex::decode(&event.sig)
        .map_err(|e| Nip01Error::Verification(format!("invalid sig hex: {}", e)))?;
    let sig = schnorr::Signature::from_slice(&sig_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid signature: {}", e)))?;
    let pubkey_bytes = hex::decode(&event.pubkey)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey hex: {}", e)))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| Nip01Error::Verification(format!("invalid pubkey: {}", e)))?;

    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_ok())
}

/// Secret key holder able to sign templates.
#[derive(Clone)]
pub struct Keys {
    secret_key: [u8; 32],
    public_key: String,
}

impl Keys {
    /// Wrap an existing secret key.
    pub fn new(secret_key: [u8; 32]) -> Result<Self, Nip01Error> {
        let public_key = get_public_key_hex(&secret_key)?;
        Ok(Self {
            secret_key,
            public_key,
        })
    }

    /// Parse a hex-encoded secret key.
    pub fn from_hex(secret_key: &str) -> Result<Self, Nip01Error> {
        let bytes = hex::decode(secret_key.trim())
            .map_err(|e| Nip01Error::InvalidSecretKey(e.to_string()))?;
        let secret_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Nip01Error::InvalidSecretKey("expected 32 bytes".to_string()))?;
        Self::new(secret_key)
    }

    /// Fresh random keys.
    pub fn generate() -> Self {
        loop {
            if let Ok(keys) = Self::new(generate_secret_key()) {
                return keys;
            }
        }
    }

    /// Hex-encoded x-only public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Sign a template.
    pub fn sign(&self, template: &EventTemplate) -> Result<Event, Nip01Error> {
        finalize_event(template, &self.secret_key)
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Sort events in reverse-chronological order by created_at,
/// then by id (lexicographically) in case of ties.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}
