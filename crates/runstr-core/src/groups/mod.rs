//! NIP-29 groups: membership derived from the add/remove log, chat and
//! metadata.

mod membership;
mod messages;

pub use membership::{
    MembershipFact, MembershipService, NoRecordPolicy, SELF_JOIN_CONTENT, derive,
    latest_record, metadata_author,
};
pub use messages::GroupChat;
