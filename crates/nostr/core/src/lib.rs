//! Nostr protocol types for the RUNSTR client.
//!
//! This crate provides:
//! - NIP-01: Events, templates, signing and verification
//! - NIP-19: `naddr` encoding and decoding
//! - NIP-29: Relay-based group kinds, tags and metadata, plus the NIP-51
//!   list of groups a user follows
//!
//! Transport lives in `nostr-client`.

mod nip01;
mod nip19;
mod nip29;

pub use nip01::{
    Event, EventTemplate, KIND_METADATA, KIND_REACTION, KIND_REPOST, KIND_SHORT_TEXT_NOTE, Keys,
    Nip01Error, finalize_event, generate_secret_key, get_public_key_hex, sort_events, unix_now,
    verify_event,
};
pub use nip19::{AddressPointer, Nip19Error, decode_naddr, encode_naddr};
pub use nip29::{
    DEFAULT_MEMBER_ROLE, GROUP_LIST_IDENTIFIER, GroupMetadata, KIND_GROUP_ADD_USER,
    KIND_GROUP_ADMINS, KIND_GROUP_CHAT_MESSAGE, KIND_GROUP_LIST, KIND_GROUP_METADATA,
    KIND_GROUP_REMOVE_USER, add_user_tags, chat_message_tags, group_coordinate,
    group_list_entries, metadata_tags, remove_user_tags, resolve_group_id,
};
