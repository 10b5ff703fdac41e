//! Reputation gate
//!
//! Per-actor scalar starting at a baseline. Claim outcomes adjust it,
//! proven abuse bans, and voting requires a minimum score. The adjustments
//! are pure helpers so the engines can fold them into the same commit as
//! the claim outcome they belong to.

use std::sync::Arc;

use tracing::warn;

use crate::config::PolicyConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{paths, AuditEntry, Role, UserProfile};
use crate::store::{get_doc, DocumentStore, Precondition, Write};

/// Reject voters below the reputation threshold or banned outright.
pub fn ensure_can_vote(profile: &UserProfile, policy: &PolicyConfig) -> EngineResult<()> {
    if profile.banned {
        return Err(EngineError::PermissionDenied("account is banned".into()));
    }
    if profile.reputation < policy.reputation_vote_threshold {
        return Err(EngineError::PermissionDenied(format!(
            "reputation {} below voting threshold {}",
            profile.reputation, policy.reputation_vote_threshold
        )));
    }
    Ok(())
}

pub fn after_claim_approved(reputation: i32, policy: &PolicyConfig) -> i32 {
    reputation.saturating_add(policy.reputation_approved_bonus)
}

pub fn after_claim_rejected(reputation: i32, policy: &PolicyConfig) -> i32 {
    reputation.saturating_sub(policy.reputation_rejected_penalty)
}

pub struct ReputationService {
    store: Arc<dyn DocumentStore>,
    policy: PolicyConfig,
}

impl ReputationService {
    pub fn new(store: Arc<dyn DocumentStore>, policy: PolicyConfig) -> Self {
        Self { store, policy }
    }

    /// Privileged: heavy penalty plus ban for proven abuse. Audited in the
    /// same commit.
    pub async fn penalize_abuse(
        &self,
        moderator: &UserProfile,
        target_id: &str,
        detail: &str,
    ) -> EngineResult<()> {
        if !moderator.has_role(Role::Moderator) && !moderator.has_role(Role::Admin) {
            return Err(EngineError::PermissionDenied(
                "abuse penalty requires a moderator role".into(),
            ));
        }

        let snap = get_doc::<UserProfile>(self.store.as_ref(), &paths::user(target_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", target_id)))?;

        let mut profile = snap.doc;
        profile.reputation = profile
            .reputation
            .saturating_sub(self.policy.reputation_abuse_penalty);
        profile.banned = true;

        let audit = AuditEntry::new(&moderator.id, "abuse_penalty", &paths::user(target_id), detail);
        self.store
            .commit(vec![
                Write::put(
                    paths::user(target_id),
                    Precondition::Revision(snap.revision),
                    &profile,
                )?,
                Write::put(paths::audit(&audit.id), Precondition::NotExists, &audit)?,
            ])
            .await?;

        warn!("banned {} for abuse ({})", target_id, detail);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryStore;

    fn policy() -> PolicyConfig {
        Config::default().policy
    }

    #[test]
    fn test_vote_gate() {
        let policy = policy();
        let mut profile = UserProfile::new("v1", policy.reputation_baseline);
        assert!(ensure_can_vote(&profile, &policy).is_ok());

        profile.reputation = policy.reputation_vote_threshold - 1;
        assert!(matches!(
            ensure_can_vote(&profile, &policy),
            Err(EngineError::PermissionDenied(_))
        ));

        profile.reputation = policy.reputation_baseline;
        profile.banned = true;
        assert!(ensure_can_vote(&profile, &policy).is_err());
    }

    #[test]
    fn test_outcome_adjustments() {
        let policy = policy();
        assert_eq!(after_claim_approved(50, &policy), 55);
        assert_eq!(after_claim_rejected(50, &policy), 40);
        assert_eq!(after_claim_rejected(i32::MIN, &policy), i32::MIN);
    }

    #[tokio::test]
    async fn test_abuse_penalty_requires_moderator() {
        let store = Arc::new(MemoryStore::new());
        let policy = policy();
        let service = ReputationService::new(store.clone(), policy.clone());

        let target = UserProfile::new("offender", policy.reputation_baseline);
        store
            .commit(vec![Write::put(
                paths::user("offender"),
                Precondition::NotExists,
                &target,
            )
            .unwrap()])
            .await
            .unwrap();

        let civilian = UserProfile::new("civilian", policy.reputation_baseline);
        assert!(matches!(
            service.penalize_abuse(&civilian, "offender", "spam").await,
            Err(EngineError::PermissionDenied(_))
        ));

        let mut moderator = UserProfile::new("mod", policy.reputation_baseline);
        moderator.roles.push(Role::Moderator);
        service
            .penalize_abuse(&moderator, "offender", "spam")
            .await
            .unwrap();

        let after = get_doc::<UserProfile>(store.as_ref(), &paths::user("offender"))
            .await
            .unwrap()
            .unwrap();
        assert!(after.doc.banned);
        assert_eq!(after.doc.reputation, 25);
    }
}
