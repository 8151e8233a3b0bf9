//! NIP-29: Relay-based groups.
//!
//! Membership is an append-only log: `9002` adds a user, `9003` removes one.
//! Both reference the group with an `h` tag and the affected user with a `p`
//! tag. Group metadata lives in the addressable kind `39000`. The groups a
//! user follows are kept in a NIP-51 list (kind `30001`, `d` = `groups`) of
//! `a` tags.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/29.md>

use crate::nip01::Event;
use crate::nip19::{AddressPointer, Nip19Error, decode_naddr};
use serde::{Deserialize, Serialize};

/// Group chat message.
pub const KIND_GROUP_CHAT_MESSAGE: u16 = 9;
/// Moderation: add user to group.
pub const KIND_GROUP_ADD_USER: u16 = 9002;
/// Moderation: remove user from group.
pub const KIND_GROUP_REMOVE_USER: u16 = 9003;
/// Group metadata (addressable, `d` tag = group id).
pub const KIND_GROUP_METADATA: u16 = 39000;
/// Group admins list.
pub const KIND_GROUP_ADMINS: u16 = 39001;

/// A user's list of followed groups (NIP-51, addressable).
pub const KIND_GROUP_LIST: u16 = 30001;
/// `d` tag of the group list.
pub const GROUP_LIST_IDENTIFIER: &str = "groups";

/// Default role written into add-user events.
pub const DEFAULT_MEMBER_ROLE: &str = "member";

fn tag(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Tags for a `9002` event adding `pubkey` to `group`.
pub fn add_user_tags(group: &str, pubkey: &str, role: &str) -> Vec<Vec<String>> {
    vec![tag(&["h", group]), tag(&["p", pubkey, role])]
}

/// Tags for a `9003` event removing `pubkey` from `group`.
pub fn remove_user_tags(group: &str, pubkey: &str) -> Vec<Vec<String>> {
    vec![tag(&["h", group]), tag(&["p", pubkey])]
}

/// Tags for a kind `9` chat message.
pub fn chat_message_tags(group: &str, sender: &str) -> Vec<Vec<String>> {
    vec![tag(&["h", group]), tag(&["p", sender])]
}

/// Tags for a `39000` metadata event.
pub fn metadata_tags(identifier: &str, relays: &[String]) -> Vec<Vec<String>> {
    let mut tags = vec![tag(&["d", identifier]), tag(&["h", identifier])];
    tags.extend(relays.iter().map(|r| tag(&["relay", r])));
    tags
}

/// The `kind:pubkey:identifier` coordinate of an addressable group.
pub fn group_coordinate(pointer: &AddressPointer) -> String {
    format!("{}:{}:{}", pointer.kind, pointer.pubkey, pointer.identifier)
}

fn parse_coordinate(value: &str, relay: Option<&str>) -> Option<AddressPointer> {
    let mut parts = value.splitn(3, ':');
    let kind = parts.next()?.parse::<u32>().ok()?;
    let pubkey = parts.next()?;
    let identifier = parts.next()?;
    if pubkey.len() != 64 || !pubkey.chars().all(|c| c.is_ascii_hexdigit()) || identifier.is_empty() {
        return None;
    }
    Some(AddressPointer {
        identifier: identifier.to_string(),
        pubkey: pubkey.to_string(),
        kind,
        relays: relay
            .filter(|r| !r.trim().is_empty())
            .map(|r| vec![r.to_string()])
            .unwrap_or_default(),
    })
}

/// Groups referenced by the `a` tags of a group list event.
///
/// Coordinates that don't parse are skipped. A third tag element is kept as
/// a relay hint.
pub fn group_list_entries(event: &Event) -> Vec<AddressPointer> {
    event
        .tags
        .iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("a"))
        .filter_map(|tag| parse_coordinate(tag.get(1)?, tag.get(2).map(String::as_str)))
        .collect()
}

/// Human readable group metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

impl GroupMetadata {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.about.is_none() && self.picture.is_none()
    }

    /// Read metadata from a `39000` event.
    ///
    /// JSON content wins. Otherwise `name`/`about`/`picture` tags are used, and
    /// when neither yields anything a placeholder name is derived from the id.
    pub fn from_event(event: &Event, identifier: &str) -> Self {
        let from_content = if event.content.trim().is_empty() {
            None
        } else {
            serde_json::from_str::<GroupMetadata>(&event.content).ok()
        };
        if let Some(metadata) = from_content.filter(|m| !m.is_empty()) {
            return metadata;
        }

        let from_tags = GroupMetadata {
            name: event.first_tag_value("name").map(str::to_string),
            about: event.first_tag_value("about").map(str::to_string),
            picture: event.first_tag_value("picture").map(str::to_string),
        };
        if !from_tags.is_empty() {
            return from_tags;
        }

        let short: String = identifier.chars().take(8).collect();
        GroupMetadata {
            name: Some(format!("Group {}...", short)),
            about: Some("No description".to_string()),
            picture: None,
        }
    }
}

/// Resolve user input to a raw group id.
///
/// `naddr1...` strings are decoded to their identifier. Anything else is
/// taken as a raw id. Blank input yields `None`.
pub fn resolve_group_id(input: &str) -> Result<Option<String>, Nip19Error> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(None);
    }
    if input.starts_with("naddr1") {
        return decode_naddr(input).map(|pointer| Some(pointer.identifier));
    }
    Ok(Some(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip19::{AddressPointer, encode_naddr};

    fn metadata_event(content: &str, tags: Vec<Vec<String>>) -> Event {
        Event {
            id: "m1".to_string(),
            pubkey: "admin".to_string(),
            created_at: 10,
            kind: KIND_GROUP_METADATA,
            tags,
            content: content.to_string(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_tag_builders() {
        assert_eq!(
            add_user_tags("g1", "pk", DEFAULT_MEMBER_ROLE),
            vec![tag(&["h", "g1"]), tag(&["p", "pk", "member"])]
        );
        assert_eq!(remove_user_tags("g1", "pk")[1], tag(&["p", "pk"]));
        assert_eq!(
            metadata_tags("g1", &["wss://r".to_string()]),
            vec![tag(&["d", "g1"]), tag(&["h", "g1"]), tag(&["relay", "wss://r"])]
        );
    }

    #[test]
    fn test_group_list_entries() {
        let founder = "ab".repeat(32);
        let event = Event {
            id: "l1".to_string(),
            pubkey: "runner".to_string(),
            created_at: 10,
            kind: KIND_GROUP_LIST,
            tags: vec![
                tag(&["d", GROUP_LIST_IDENTIFIER]),
                tag(&["a", &format!("39000:{founder}:sunrise"), "wss://groups.example.com"]),
                tag(&["a", &format!("39000:{founder}:trail:crew")]),
                tag(&["a", "39000:short:bad"]),
                tag(&["a", &format!("x:{founder}:bad")]),
                tag(&["a", &format!("39000:{founder}:")]),
                tag(&["e", "sunrise"]),
            ],
            content: String::new(),
            sig: String::new(),
        };

        let entries = group_list_entries(&event);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identifier, "sunrise");
        assert_eq!(entries[0].relays, vec!["wss://groups.example.com".to_string()]);
        assert_eq!(entries[1].identifier, "trail:crew");
        assert!(entries[1].relays.is_empty());
        assert_eq!(
            group_coordinate(&entries[0]),
            format!("39000:{founder}:sunrise")
        );
    }

    #[test]
    fn test_metadata_from_content() {
        let event = metadata_event(r#"{"name":"Morning Runners","about":"5am club"}"#, vec![]);
        let metadata = GroupMetadata::from_event(&event, "g1");
        assert_eq!(metadata.name.as_deref(), Some("Morning Runners"));
        assert_eq!(metadata.about.as_deref(), Some("5am club"));
    }

    #[test]
    fn test_metadata_from_tags() {
        let event = metadata_event("not json", vec![tag(&["name", "Trail Crew"])]);
        let metadata = GroupMetadata::from_event(&event, "g1");
        assert_eq!(metadata.name.as_deref(), Some("Trail Crew"));
        assert_eq!(metadata.about, None);
    }

    #[test]
    fn test_metadata_placeholder() {
        let event = metadata_event("", vec![]);
        let metadata = GroupMetadata::from_event(&event, "0123456789abcdef");
        assert_eq!(metadata.name.as_deref(), Some("Group 01234567..."));
    }

    #[test]
    fn test_resolve_group_id() {
        assert_eq!(resolve_group_id("  ").unwrap(), None);
        assert_eq!(resolve_group_id("runclub").unwrap().as_deref(), Some("runclub"));

        let naddr = encode_naddr(&AddressPointer {
            identifier: "runclub".to_string(),
            pubkey: "ab".repeat(32),
            kind: KIND_GROUP_METADATA as u32,
            relays: vec![],
        })
        .unwrap();
        assert_eq!(resolve_group_id(&naddr).unwrap().as_deref(), Some("runclub"));
        assert!(resolve_group_id("naddr1bogus").is_err());
    }
}
