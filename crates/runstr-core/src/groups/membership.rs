//! Group membership derived from the add/remove log.
//!
//! Nothing here is stored. Each answer comes from the latest `9002`/`9003`
//! record naming the (group, actor) pair that the last query turned up.

use crate::config::{MembershipConfig, SchedulerConfig};
use crate::error::{CoreError, Result};
use crate::fetch::{FetchRequest, Fetcher};
use crate::publish::{Publisher, Signer};
use crate::scheduler::{OperationClass, OperationGuard, OperationScheduler};
use nostr::{
    DEFAULT_MEMBER_ROLE, Event, EventTemplate, KIND_GROUP_ADD_USER, KIND_GROUP_METADATA,
    KIND_GROUP_REMOVE_USER, add_user_tags, remove_user_tags, unix_now,
};
use nostr_client::Filter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Content of a self-join record.
pub const SELF_JOIN_CONTENT: &str = "Self-added to group";

/// Current state of one actor in one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipFact {
    Member,
    NotMember,
}

impl MembershipFact {
    pub fn is_member(self) -> bool {
        self == MembershipFact::Member
    }
}

/// What to answer when the log holds no record for the pair.
///
/// The default treats groups as open: anyone never explicitly removed counts
/// as a member. Closed deployments should pick `AssumeNotMember`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoRecordPolicy {
    #[default]
    AssumeMember,
    AssumeNotMember,
}

impl NoRecordPolicy {
    fn fact(self) -> MembershipFact {
        match self {
            NoRecordPolicy::AssumeMember => MembershipFact::Member,
            NoRecordPolicy::AssumeNotMember => MembershipFact::NotMember,
        }
    }
}

fn references(record: &Event, group: &str, actor: &str) -> bool {
    matches!(record.kind, KIND_GROUP_ADD_USER | KIND_GROUP_REMOVE_USER)
        && record.has_tag("h", group)
        && record.has_tag("p", actor)
}

/// Newest add/remove record naming `actor` in `group`. Equal timestamps go
/// to the larger record id.
pub fn latest_record<'a>(records: &'a [Event], group: &str, actor: &str) -> Option<&'a Event> {
    records
        .iter()
        .filter(|record| references(record, group, actor))
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Membership of `actor` in `group` according to `records`.
///
/// Records of other kinds, groups or actors are ignored. The newest qualifying
/// record decides, see [`latest_record`].
pub fn derive(
    records: &[Event],
    group: &str,
    actor: &str,
    policy: NoRecordPolicy,
) -> MembershipFact {
    latest_record(records, group, actor).map_or_else(
            || policy.fact(),
            |latest| {
                if latest.kind == KIND_GROUP_ADD_USER {
                    MembershipFact::Member
                } else {
                    MembershipFact::NotMember
                }
            },
        )
}

/// Author of the newest metadata record, the closest thing a group has to an
/// owner. Anyone able to publish a newer `39000` takes this over.
pub fn metadata_author(records: &[Event]) -> Option<&str> {
    records
        .iter()
        .filter(|record| record.kind == KIND_GROUP_METADATA)
        .max_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|record| record.pubkey.as_str())
}

fn short_key(pubkey: &str) -> String {
    pubkey.chars().take(8).collect()
}

/// Derived fact plus the timestamp of the record it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lookup {
    fact: MembershipFact,
    latest: Option<u64>,
}

/// Membership queries and idempotent join/leave.
pub struct MembershipService {
    fetcher: Arc<dyn Fetcher>,
    publisher: Arc<dyn Publisher>,
    signer: Option<Arc<dyn Signer>>,
    scheduler: Arc<OperationScheduler>,
    relays: Vec<String>,
    timeout: Duration,
    config: MembershipConfig,
    scheduler_config: SchedulerConfig,
}

impl MembershipService {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        publisher: Arc<dyn Publisher>,
        signer: Option<Arc<dyn Signer>>,
        scheduler: Arc<OperationScheduler>,
        relays: Vec<String>,
        timeout: Duration,
        config: MembershipConfig,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            fetcher,
            publisher,
            signer,
            scheduler,
            relays,
            timeout,
            config,
            scheduler_config,
        }
    }

    pub fn policy(&self) -> NoRecordPolicy {
        self.config.no_record_policy
    }

    fn signer(&self) -> Result<&Arc<dyn Signer>> {
        self.signer.as_ref().ok_or(CoreError::NoSigner)
    }

    fn request(&self, filter: Filter) -> FetchRequest {
        FetchRequest::new(filter)
            .relays(self.relays.clone())
            .timeout(self.timeout)
    }

    async fn admit(&self, action: &str) -> Result<OperationGuard> {
        let mut backoff = self.scheduler_config.backoff();
        self.scheduler
            .admit(OperationClass::Group, &mut backoff)
            .await
            .ok_or_else(|| CoreError::Deferred(action.to_string()))
    }

    /// Run the membership query and derive the fact.
    ///
    /// Errors only when no relay answered at all, so callers can tell an
    /// empty log from a failed lookup.
    pub async fn query_fact(&self, group: &str, actor: &str) -> Result<MembershipFact> {
        Ok(self.lookup(group, actor).await?.fact)
    }

    async fn lookup(&self, group: &str, actor: &str) -> Result<Lookup> {
        let filter = Filter::new()
            .kinds(vec![KIND_GROUP_ADD_USER, KIND_GROUP_REMOVE_USER])
            .groups(vec![group.to_string()])
            .pubkey_refs(vec![actor.to_string()])
            .limit(1);
        let report = self.fetcher.fetch(&self.request(filter)).await;
        if report.is_empty() && report.relays_responded == 0 {
            return Err(report.into_result().err().unwrap_or(CoreError::NoRelays));
        }
        Ok(Lookup {
            fact: derive(&report.events, group, actor, self.policy()),
            latest: latest_record(&report.events, group, actor).map(|r| r.created_at),
        })
    }

    /// Whether `actor` is in `group`. A failed lookup counts as membership.
    pub async fn is_member(&self, group: &str, actor: &str) -> bool {
        match self.query_fact(group, actor).await {
            Ok(fact) => fact.is_member(),
            Err(e) => {
                warn!(group, actor, "Membership lookup failed, assuming member: {}", e);
                true
            }
        }
    }

    /// Whether `pubkey` authored the group's newest metadata record.
    ///
    /// This is authorship, not access control. False when the lookup fails.
    pub async fn is_admin(&self, group: &str, pubkey: &str) -> bool {
        let filter = Filter::new()
            .kinds(vec![KIND_GROUP_METADATA])
            .identifiers(vec![group.to_string()])
            .limit(1);
        let report = self.fetcher.fetch(&self.request(filter)).await;
        match metadata_author(&report.events) {
            Some(author) => author == pubkey,
            None => {
                debug!(group, "No metadata record found for admin check");
                false
            }
        }
    }

    /// Membership before publishing. A failed lookup lets the action through.
    async fn current_or_open(&self, group: &str, actor: &str) -> Option<Lookup> {
        match self.lookup(group, actor).await {
            Ok(lookup) => Some(lookup),
            Err(e) => {
                warn!(group, actor, "Membership lookup failed, proceeding: {}", e);
                None
            }
        }
    }

    /// Sign and publish a record that must sort after `supersedes`.
    async fn sign_and_publish(
        &self,
        signer: &Arc<dyn Signer>,
        template: EventTemplate,
        supersedes: Option<u64>,
    ) -> Result<Event> {
        let created_at = supersedes.map_or(unix_now(), |latest| unix_now().max(latest + 1));
        let event = signer.sign(&template.created_at(created_at))?;
        let accepted = self.publisher.publish(&event, &self.relays).await?;
        debug!(id = %event.id, kind = event.kind, accepted, "Published membership record");
        Ok(event)
    }

    /// Add the signing user to `group`.
    ///
    /// Returns the new add record, or `None` when already a member.
    pub async fn join(&self, group: &str) -> Result<Option<Event>> {
        let signer = self.signer()?;
        let _guard = self.admit("join").await?;
        let actor = signer.public_key();

        let current = self.current_or_open(group, &actor).await;
        if current.is_some_and(|c| c.fact.is_member()) {
            debug!(group, "Already a member, nothing to publish");
            return Ok(None);
        }

        let template = EventTemplate::new(KIND_GROUP_ADD_USER, SELF_JOIN_CONTENT)
            .tags(add_user_tags(group, &actor, DEFAULT_MEMBER_ROLE));
        let event = self
            .sign_and_publish(signer, template, current.and_then(|c| c.latest))
            .await?;
        info!(group, "Joined group");
        Ok(Some(event))
    }

    /// Remove `actor` from `group`.
    ///
    /// Allowed for the actor themself or the group admin. Returns `None` when
    /// the actor is already out.
    pub async fn leave(&self, group: &str, actor: &str) -> Result<Option<Event>> {
        let signer = self.signer()?;
        let _guard = self.admit("leave").await?;
        let caller = signer.public_key();

        if caller != actor && !self.is_admin(group, &caller).await {
            return Err(CoreError::PermissionDenied(
                "Only group admins or the user themselves can remove a member.".to_string(),
            ));
        }

        let current = self.current_or_open(group, actor).await;
        if current.is_some_and(|c| !c.fact.is_member()) {
            debug!(group, actor, "Not a member, nothing to publish");
            return Ok(None);
        }

        let template = EventTemplate::new(
            KIND_GROUP_REMOVE_USER,
            format!("Removing {}...", short_key(actor)),
        )
        .tags(remove_user_tags(group, actor));
        let event = self
            .sign_and_publish(signer, template, current.and_then(|c| c.latest))
            .await?;
        info!(group, actor, "Removed from group");
        Ok(Some(event))
    }

    /// Add `target` to `group` with `role`. Admin only.
    pub async fn add_member(
        &self,
        group: &str,
        target: &str,
        role: &str,
    ) -> Result<Option<Event>> {
        let signer = self.signer()?;
        let _guard = self.admit("add member").await?;
        let caller = signer.public_key();

        if !self.is_admin(group, &caller).await {
            return Err(CoreError::PermissionDenied(
                "Only group admins can add members.".to_string(),
            ));
        }

        let current = self.current_or_open(group, target).await;
        if current.is_some_and(|c| c.fact.is_member()) {
            debug!(group, target, "Already a member, nothing to publish");
            return Ok(None);
        }

        let template = EventTemplate::new(
            KIND_GROUP_ADD_USER,
            format!("Adding {}... as {}", short_key(target), role),
        )
        .tags(add_user_tags(group, target, role));
        let event = self
            .sign_and_publish(signer, template, current.and_then(|c| c.latest))
            .await?;
        info!(group, target, role, "Added member");
        Ok(Some(event))
    }
}
