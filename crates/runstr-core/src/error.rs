//! Error types for the RUNSTR core.
//!
//! Relay-level trouble (a socket that never opens, a slow relay, a garbled
//! frame) is absorbed by the fetch layer. What reaches callers is either a
//! capability problem the user can fix or a total failure.

use nostr::Nip01Error;
use nostr_client::ClientError;
use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum CoreError {
    /// Publishing needs a signing key and none is configured
    #[error("No signer available; connect a key to publish")]
    NoSigner,

    /// The acting user lacks the privilege for a group action
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A query was issued with no usable relay
    #[error("No relays available for this request")]
    NoRelays,

    /// Relays answered but held nothing matching
    #[error("Nothing found")]
    NothingFound,

    /// Not a single relay could be reached
    #[error("Could not reach the network")]
    NetworkUnreachable,

    /// Admission never came; try again later
    #[error("Busy with higher-priority work, try again later ({0})")]
    Deferred(String),

    /// Input that can't name a group
    #[error("Invalid group reference: {0}")]
    InvalidGroup(String),

    /// Relay client failure
    #[error("Relay client error: {0}")]
    Client(#[from] ClientError),

    /// Event signing failure
    #[error("Signing error: {0}")]
    Signing(#[from] Nip01Error),

    /// Configuration could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    /// Errors the user has to act on rather than retry.
    pub fn is_capability(&self) -> bool {
        matches!(self, CoreError::NoSigner | CoreError::PermissionDenied(_))
    }
}

/// Core result type
pub type Result<T> = std::result::Result<T, CoreError>;
