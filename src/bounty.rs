//! Bounty settlement engine
//!
//! One-to-many claim/vote/payout workflow bound to a spot. Funds move
//! through the internal ledger: the reward is held at creation, paid out
//! with platform-fee and filmer-split accounting on approval, or refunded
//! at the listing-fee ratio on expiry.
//!
//! Concurrency guards: one claim per claimer (claim doc id = claimer id,
//! not-exists precondition), one vote per voter (same trick), and one
//! approved claim per bounty (the bounty lock, which only the first
//! successful commit can acquire).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::require_user;
use crate::config::PolicyConfig;
use crate::error::{EngineError, EngineResult};
use crate::ledger::{self, TxBuilder};
use crate::model::{
    paths, AuditEntry, Bounty, BountyStatus, Claim, ClaimStatus, FilmerTag, LedgerTxType, Role,
    VerificationPolicy, Vote,
};
use crate::notify::{Notification, NotificationDispatcher, NotificationKind};
use crate::ratelimit::{ActionClass, RateLimiter};
use crate::reputation;
use crate::store::{
    self, get_doc, DocumentStore, Precondition, StoreError, Write, MAX_TXN_ATTEMPTS,
};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBountyRequest {
    pub spot_id: String,
    pub trick_description: String,
    pub reward: u64,
    pub expires_at: DateTime<Utc>,
    /// Optional override of the default quorum rules.
    pub rules: Option<VerificationPolicy>,
}

#[derive(Debug, Serialize)]
pub struct CreateBountyResponse {
    pub bounty_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitClaimRequest {
    pub clip_storage_path: String,
    pub duration_secs: f64,
    pub filmer_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitClaimResponse {
    pub claim_id: String,
}

pub struct BountyEngine {
    store: Arc<dyn DocumentStore>,
    limiter: Arc<RateLimiter>,
    notifier: Arc<NotificationDispatcher>,
    policy: PolicyConfig,
}

impl BountyEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        limiter: Arc<RateLimiter>,
        notifier: Arc<NotificationDispatcher>,
        policy: PolicyConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            notifier,
            policy,
        }
    }

    // ========================================================================
    // CREATE / CLAIM
    // ========================================================================

    pub async fn create_bounty(
        &self,
        actor_id: &str,
        request: CreateBountyRequest,
    ) -> EngineResult<CreateBountyResponse> {
        require_user(self.store.as_ref(), actor_id).await?;

        if request.reward < self.policy.min_bounty_reward {
            return Err(EngineError::InvalidArgument(format!(
                "reward below minimum of {}",
                self.policy.min_bounty_reward
            )));
        }
        if request.expires_at <= Utc::now() {
            return Err(EngineError::InvalidArgument(
                "expiry must be in the future".into(),
            ));
        }
        if request.trick_description.trim().is_empty() {
            return Err(EngineError::InvalidArgument(
                "trick description is required".into(),
            ));
        }

        self.limiter
            .check_and_update(actor_id, ActionClass::BountyCreate)
            .await?;

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let creator = require_user(self.store.as_ref(), actor_id).await?;
            if creator.doc.wallet_balance < request.reward {
                return Err(EngineError::FailedPrecondition(format!(
                    "balance {} below reward {}",
                    creator.doc.wallet_balance, request.reward
                )));
            }

            let mut creator_doc = creator.doc;
            creator_doc.wallet_balance -= request.reward;

            let now = Utc::now();
            let bounty = Bounty {
                id: Uuid::new_v4().to_string(),
                spot_id: request.spot_id.clone(),
                creator_id: actor_id.to_string(),
                trick_description: request.trick_description.clone(),
                reward: request.reward,
                currency: self.policy.currency.clone(),
                platform_fee_bps: self.policy.platform_fee_bps,
                filmer_cut_bps: self.policy.filmer_cut_bps,
                status: BountyStatus::Open,
                policy: request.rules.unwrap_or(VerificationPolicy {
                    min_votes: self.policy.min_votes,
                    approve_ratio_bps: self.policy.approve_ratio_bps,
                }),
                expires_at: request.expires_at,
                lock_reason: None,
                claim_count: 0,
                created_at: now,
                updated_at: now,
            };

            let hold = TxBuilder::new(LedgerTxType::Hold, request.reward, &self.policy.currency)
                .from_user(actor_id)
                .bounty(&bounty.id)
                .into_write()?;

            let writes = vec![
                Write::put(
                    paths::user(actor_id),
                    Precondition::Revision(creator.revision),
                    &creator_doc,
                )?,
                Write::put(paths::bounty(&bounty.id), Precondition::NotExists, &bounty)?,
                hold,
            ];

            match self.store.commit(writes).await {
                Ok(()) => {
                    info!(
                        "bounty {} created by {} at spot {} for {}",
                        bounty.id, actor_id, bounty.spot_id, bounty.reward
                    );
                    return Ok(CreateBountyResponse {
                        bounty_id: bounty.id,
                    });
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal("bounty create contention".into()))
    }

    pub async fn submit_claim(
        &self,
        actor_id: &str,
        bounty_id: &str,
        request: SubmitClaimRequest,
    ) -> EngineResult<SubmitClaimResponse> {
        require_user(self.store.as_ref(), actor_id).await?;
        if let Some(filmer_id) = &request.filmer_id {
            if filmer_id == actor_id {
                return Err(EngineError::InvalidArgument(
                    "cannot tag yourself as filmer".into(),
                ));
            }
            require_user(self.store.as_ref(), filmer_id).await?;
        }

        self.limiter
            .check_and_update(actor_id, ActionClass::ClaimSubmit)
            .await?;

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let bounty_snap = self.load_bounty(bounty_id).await?;
            let mut bounty = bounty_snap.doc;

            if bounty.creator_id == actor_id {
                return Err(EngineError::PermissionDenied(
                    "cannot claim your own bounty".into(),
                ));
            }
            if bounty.status != BountyStatus::Open {
                return Err(EngineError::FailedPrecondition(format!(
                    "bounty is not open (status {:?})",
                    bounty.status
                )));
            }
            // Lazy expiry: the sweep may not have run yet.
            if Utc::now() > bounty.expires_at {
                return Err(EngineError::DeadlineExceeded("bounty has expired".into()));
            }

            let claim_path = paths::claim(bounty_id, actor_id);
            if get_doc::<Claim>(self.store.as_ref(), &claim_path)
                .await?
                .is_some()
            {
                return Err(EngineError::FailedPrecondition(
                    "already claimed this bounty".into(),
                ));
            }

            let now = Utc::now();
            let claim = Claim {
                claimer_id: actor_id.to_string(),
                clip_storage_path: request.clip_storage_path.clone(),
                declared_duration_secs: request.duration_secs,
                filmer: request.filmer_id.clone().map(|filmer_id| FilmerTag {
                    filmer_id,
                    confirmed: false,
                }),
                status: ClaimStatus::Pending,
                approve_votes: 0,
                reject_votes: 0,
                payout: None,
                created_at: now,
                updated_at: now,
            };

            bounty.claim_count += 1;
            bounty.updated_at = now;

            let writes = vec![
                Write::put(&claim_path, Precondition::NotExists, &claim)?,
                Write::put(
                    paths::bounty(bounty_id),
                    Precondition::Revision(bounty_snap.revision),
                    &bounty,
                )?,
            ];

            match self.store.commit(writes).await {
                Ok(()) => {
                    info!("claim on bounty {} by {}", bounty_id, actor_id);
                    let mut notifications = vec![Notification::new(
                        &bounty.creator_id,
                        NotificationKind::ClaimSubmitted,
                        claim_path.clone(),
                        format!("{} claims your bounty", actor_id),
                    )];
                    if let Some(tag) = &claim.filmer {
                        notifications.push(Notification::new(
                            &tag.filmer_id,
                            NotificationKind::FilmerTagged,
                            claim_path.clone(),
                            format!("{} tagged you as filmer", actor_id),
                        ));
                    }
                    self.notifier.dispatch(notifications).await;
                    return Ok(SubmitClaimResponse {
                        claim_id: actor_id.to_string(),
                    });
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal("claim submit contention".into()))
    }

    pub async fn withdraw_claim(&self, actor_id: &str, bounty_id: &str) -> EngineResult<()> {
        require_user(self.store.as_ref(), actor_id).await?;

        let claim_path = paths::claim(bounty_id, actor_id);
        let snap = get_doc::<Claim>(self.store.as_ref(), &claim_path)
            .await?
            .ok_or_else(|| EngineError::NotFound("claim".into()))?;

        let mut claim = snap.doc;
        if claim.status != ClaimStatus::Pending {
            return Err(EngineError::FailedPrecondition(
                "only a pending claim can be withdrawn".into(),
            ));
        }
        claim.status = ClaimStatus::Withdrawn;
        claim.updated_at = Utc::now();

        self.store
            .commit(vec![Write::put(
                &claim_path,
                Precondition::Revision(snap.revision),
                &claim,
            )?])
            .await?;
        Ok(())
    }

    pub async fn confirm_filmer_tag(
        &self,
        actor_id: &str,
        bounty_id: &str,
        claim_id: &str,
        accept: bool,
    ) -> EngineResult<()> {
        require_user(self.store.as_ref(), actor_id).await?;

        let claim_path = paths::claim(bounty_id, claim_id);
        let snap = get_doc::<Claim>(self.store.as_ref(), &claim_path)
            .await?
            .ok_or_else(|| EngineError::NotFound("claim".into()))?;

        let mut claim = snap.doc;
        match &mut claim.filmer {
            Some(tag) if tag.filmer_id == actor_id => {
                if accept {
                    tag.confirmed = true;
                } else {
                    claim.filmer = None;
                }
            }
            Some(_) => {
                return Err(EngineError::PermissionDenied(
                    "only the tagged filmer can confirm".into(),
                ))
            }
            None => {
                return Err(EngineError::FailedPrecondition(
                    "claim has no filmer tag".into(),
                ))
            }
        }
        if matches!(claim.status, ClaimStatus::Paid) {
            return Err(EngineError::FailedPrecondition(
                "claim already paid out".into(),
            ));
        }
        claim.updated_at = Utc::now();

        self.store
            .commit(vec![Write::put(
                &claim_path,
                Precondition::Revision(snap.revision),
                &claim,
            )?])
            .await?;
        Ok(())
    }

    // ========================================================================
    // VERIFICATION
    // ========================================================================

    pub async fn cast_vote(
        &self,
        actor_id: &str,
        bounty_id: &str,
        claim_id: &str,
        approve: bool,
        comment: Option<String>,
    ) -> EngineResult<()> {
        let voter = require_user(self.store.as_ref(), actor_id).await?;
        reputation::ensure_can_vote(&voter.doc, &self.policy)?;
        if actor_id == claim_id {
            return Err(EngineError::PermissionDenied(
                "cannot vote on your own claim".into(),
            ));
        }

        self.limiter
            .check_and_update(actor_id, ActionClass::VoteCast)
            .await?;

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let bounty_snap = self.load_bounty(bounty_id).await?;
            let claim_path = paths::claim(bounty_id, claim_id);
            let claim_snap = get_doc::<Claim>(self.store.as_ref(), &claim_path)
                .await?
                .ok_or_else(|| EngineError::NotFound("claim".into()))?;

            let mut claim = claim_snap.doc;
            if claim.status != ClaimStatus::Pending {
                return Err(EngineError::FailedPrecondition(format!(
                    "claim is not open for voting (status {:?})",
                    claim.status
                )));
            }

            let vote_path = paths::vote(bounty_id, claim_id, actor_id);
            if get_doc::<Vote>(self.store.as_ref(), &vote_path)
                .await?
                .is_some()
            {
                return Err(EngineError::FailedPrecondition(
                    "already voted on this claim".into(),
                ));
            }

            let vote = Vote {
                voter_id: actor_id.to_string(),
                approve,
                weight: 1,
                comment: comment.clone(),
                cast_at: Utc::now(),
            };
            if approve {
                claim.approve_votes += 1;
            } else {
                claim.reject_votes += 1;
            }
            claim.updated_at = Utc::now();

            // Quorum: enough votes and enough approvals, integer math only.
            // The bounty lock is the exclusivity guard: a vote on an
            // already-locked bounty is recorded but can never approve.
            let total = claim.total_votes();
            let quorum = total >= bounty_snap.doc.policy.min_votes
                && claim.approve_votes as u64 * 10_000
                    >= total as u64 * bounty_snap.doc.policy.approve_ratio_bps as u64;
            let approving = quorum && bounty_snap.doc.status == BountyStatus::Open;

            let mut writes = vec![Write::put(&vote_path, Precondition::NotExists, &vote)?];

            if approving {
                claim.status = ClaimStatus::Approved;

                let mut bounty = bounty_snap.doc.clone();
                bounty.status = BountyStatus::Locked;
                bounty.lock_reason = Some(format!("community quorum on claim {}", claim_id));
                bounty.updated_at = Utc::now();
                writes.push(Write::put(
                    paths::bounty(bounty_id),
                    Precondition::Revision(bounty_snap.revision),
                    &bounty,
                )?);

                // Claim outcome adjusts the claimer's reputation in the
                // same commit.
                let claimer = require_user(self.store.as_ref(), &claim.claimer_id).await?;
                let mut claimer_doc = claimer.doc;
                claimer_doc.reputation =
                    reputation::after_claim_approved(claimer_doc.reputation, &self.policy);
                writes.push(Write::put(
                    paths::user(&claim.claimer_id),
                    Precondition::Revision(claimer.revision),
                    &claimer_doc,
                )?);
            }

            writes.push(Write::put(
                &claim_path,
                Precondition::Revision(claim_snap.revision),
                &claim,
            )?);

            match self.store.commit(writes).await {
                Ok(()) => {
                    if approving {
                        info!(
                            "claim {} on bounty {} approved by community quorum",
                            claim_id, bounty_id
                        );
                        self.notifier
                            .dispatch(vec![Notification::new(
                                &claim.claimer_id,
                                NotificationKind::ClaimApproved,
                                claim_path.clone(),
                                "the community verified your claim",
                            )])
                            .await;
                    }
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal("vote contention".into()))
    }

    /// Creator override of community voting, with the same locking
    /// behavior on approval.
    pub async fn creator_decision(
        &self,
        actor_id: &str,
        bounty_id: &str,
        claim_id: &str,
        approve: bool,
        note: Option<String>,
    ) -> EngineResult<()> {
        require_user(self.store.as_ref(), actor_id).await?;

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let bounty_snap = self.load_bounty(bounty_id).await?;
            if bounty_snap.doc.creator_id != actor_id {
                return Err(EngineError::PermissionDenied(
                    "only the bounty creator can decide".into(),
                ));
            }

            let claim_path = paths::claim(bounty_id, claim_id);
            let claim_snap = get_doc::<Claim>(self.store.as_ref(), &claim_path)
                .await?
                .ok_or_else(|| EngineError::NotFound("claim".into()))?;

            let mut claim = claim_snap.doc;
            if claim.status != ClaimStatus::Pending {
                return Err(EngineError::FailedPrecondition(format!(
                    "claim already decided (status {:?})",
                    claim.status
                )));
            }

            let claimer = require_user(self.store.as_ref(), &claim.claimer_id).await?;
            let mut claimer_doc = claimer.doc;
            let mut writes = Vec::new();

            let kind = if approve {
                if bounty_snap.doc.status != BountyStatus::Open {
                    return Err(EngineError::FailedPrecondition(format!(
                        "bounty cannot be locked (status {:?})",
                        bounty_snap.doc.status
                    )));
                }
                claim.status = ClaimStatus::Approved;
                claimer_doc.reputation =
                    reputation::after_claim_approved(claimer_doc.reputation, &self.policy);

                let mut bounty = bounty_snap.doc.clone();
                bounty.status = BountyStatus::Locked;
                bounty.lock_reason = Some(format!("creator approval of claim {}", claim_id));
                bounty.updated_at = Utc::now();
                writes.push(Write::put(
                    paths::bounty(bounty_id),
                    Precondition::Revision(bounty_snap.revision),
                    &bounty,
                )?);
                NotificationKind::ClaimApproved
            } else {
                claim.status = ClaimStatus::Rejected;
                claimer_doc.reputation =
                    reputation::after_claim_rejected(claimer_doc.reputation, &self.policy);
                NotificationKind::ClaimRejected
            };
            claim.updated_at = Utc::now();

            let audit = AuditEntry::new(
                actor_id,
                "creator_decision",
                &claim_path,
                note.clone().unwrap_or_else(|| {
                    if approve { "approved" } else { "rejected" }.to_string()
                }),
            );
            writes.push(Write::put(
                &claim_path,
                Precondition::Revision(claim_snap.revision),
                &claim,
            )?);
            writes.push(Write::put(
                paths::user(&claim.claimer_id),
                Precondition::Revision(claimer.revision),
                &claimer_doc,
            )?);
            writes.push(Write::put(
                paths::audit(&audit.id),
                Precondition::NotExists,
                &audit,
            )?);

            match self.store.commit(writes).await {
                Ok(()) => {
                    info!(
                        "creator {} {} claim {} on bounty {}",
                        actor_id,
                        if approve { "approved" } else { "rejected" },
                        claim_id,
                        bounty_id
                    );
                    self.notifier
                        .dispatch(vec![Notification::new(
                            &claim.claimer_id,
                            kind,
                            claim_path.clone(),
                            "the bounty creator reviewed your claim",
                        )])
                        .await;
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal("creator decision contention".into()))
    }

    // ========================================================================
    // PAYOUT
    // ========================================================================

    /// Privileged payout of an approved claim. Idempotent: a second call
    /// against an already-paid claim is a no-op, never a double payment.
    pub async fn pay_out_claim(
        &self,
        actor_id: &str,
        bounty_id: &str,
        claim_id: &str,
    ) -> EngineResult<()> {
        let actor = require_user(self.store.as_ref(), actor_id).await?;
        if !actor.doc.has_role(Role::Admin) {
            return Err(EngineError::PermissionDenied(
                "payout requires an admin role".into(),
            ));
        }

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let bounty_snap = self.load_bounty(bounty_id).await?;
            let claim_path = paths::claim(bounty_id, claim_id);
            let claim_snap = get_doc::<Claim>(self.store.as_ref(), &claim_path)
                .await?
                .ok_or_else(|| EngineError::NotFound("claim".into()))?;

            let mut claim = claim_snap.doc;
            if claim.status == ClaimStatus::Paid {
                return Ok(());
            }
            if claim.status != ClaimStatus::Approved {
                return Err(EngineError::FailedPrecondition(format!(
                    "claim is not approved (status {:?})",
                    claim.status
                )));
            }
            let mut bounty = bounty_snap.doc.clone();
            if bounty.status != BountyStatus::Locked {
                return Err(EngineError::FailedPrecondition(format!(
                    "bounty is not locked for payout (status {:?})",
                    bounty.status
                )));
            }

            let filmer_confirmed = claim.filmer.as_ref().map(|t| t.confirmed).unwrap_or(false);
            let breakdown = ledger::payout_breakdown(
                bounty.reward,
                bounty.platform_fee_bps,
                bounty.filmer_cut_bps,
                filmer_confirmed,
            );

            let claimer = require_user(self.store.as_ref(), &claim.claimer_id).await?;
            let mut claimer_doc = claimer.doc;
            claimer_doc.wallet_balance += breakdown.claimer_amount;

            let mut writes = vec![
                TxBuilder::new(LedgerTxType::Fee, breakdown.platform_fee, &bounty.currency)
                    .from_user(&bounty.creator_id)
                    .bounty(bounty_id)
                    .claim(claim_id)
                    .into_write()?,
                TxBuilder::new(
                    LedgerTxType::Payout,
                    breakdown.claimer_amount,
                    &bounty.currency,
                )
                .from_user(&bounty.creator_id)
                .to_user(&claim.claimer_id)
                .bounty(bounty_id)
                .claim(claim_id)
                .into_write()?,
                Write::put(
                    paths::user(&claim.claimer_id),
                    Precondition::Revision(claimer.revision),
                    &claimer_doc,
                )?,
            ];

            let mut notifications = vec![Notification::new(
                &claim.claimer_id,
                NotificationKind::ClaimPaid,
                claim_path.clone(),
                format!("bounty payout: {}", breakdown.claimer_amount),
            )];

            if breakdown.filmer_amount > 0 {
                // Confirmed tag is guaranteed here by filmer_confirmed.
                let filmer_id = claim.filmer.as_ref().map(|t| t.filmer_id.clone());
                if let Some(filmer_id) = filmer_id {
                    let filmer = require_user(self.store.as_ref(), &filmer_id).await?;
                    let mut filmer_doc = filmer.doc;
                    filmer_doc.wallet_balance += breakdown.filmer_amount;
                    writes.push(
                        TxBuilder::new(
                            LedgerTxType::Payout,
                            breakdown.filmer_amount,
                            &bounty.currency,
                        )
                        .from_user(&bounty.creator_id)
                        .to_user(&filmer_id)
                        .bounty(bounty_id)
                        .claim(claim_id)
                        .into_write()?,
                    );
                    writes.push(Write::put(
                        paths::user(&filmer_id),
                        Precondition::Revision(filmer.revision),
                        &filmer_doc,
                    )?);
                    notifications.push(Notification::new(
                        &filmer_id,
                        NotificationKind::ClaimPaid,
                        claim_path.clone(),
                        format!("filmer cut: {}", breakdown.filmer_amount),
                    ));
                }
            }

            claim.status = ClaimStatus::Paid;
            claim.payout = Some(breakdown);
            claim.updated_at = Utc::now();
            bounty.status = BountyStatus::Paid;
            bounty.updated_at = Utc::now();

            let audit = AuditEntry::new(
                actor_id,
                "pay_out_claim",
                &claim_path,
                format!(
                    "fee={} claimer={} filmer={}",
                    breakdown.platform_fee, breakdown.claimer_amount, breakdown.filmer_amount
                ),
            );
            writes.push(Write::put(
                &claim_path,
                Precondition::Revision(claim_snap.revision),
                &claim,
            )?);
            writes.push(Write::put(
                paths::bounty(bounty_id),
                Precondition::Revision(bounty_snap.revision),
                &bounty,
            )?);
            writes.push(Write::put(
                paths::audit(&audit.id),
                Precondition::NotExists,
                &audit,
            )?);

            match self.store.commit(writes).await {
                Ok(()) => {
                    info!(
                        "paid out claim {} on bounty {}: fee={} claimer={} filmer={}",
                        claim_id,
                        bounty_id,
                        breakdown.platform_fee,
                        breakdown.claimer_amount,
                        breakdown.filmer_amount
                    );
                    self.notifier.dispatch(notifications).await;
                    return Ok(());
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal("payout contention".into()))
    }

    // ========================================================================
    // EXPIRY / CANCELLATION
    // ========================================================================

    /// Creator cancellation of an open bounty with no pending claims.
    /// Full refund; the listing fee only applies to expiry.
    pub async fn cancel_bounty(&self, actor_id: &str, bounty_id: &str) -> EngineResult<()> {
        require_user(self.store.as_ref(), actor_id).await?;

        let bounty_snap = self.load_bounty(bounty_id).await?;
        let mut bounty = bounty_snap.doc;
        if bounty.creator_id != actor_id {
            return Err(EngineError::PermissionDenied(
                "only the creator can cancel".into(),
            ));
        }
        if bounty.status != BountyStatus::Open {
            return Err(EngineError::FailedPrecondition(format!(
                "bounty is not open (status {:?})",
                bounty.status
            )));
        }
        if self.has_pending_claims(bounty_id).await? {
            return Err(EngineError::FailedPrecondition(
                "bounty has pending claims".into(),
            ));
        }

        let creator = require_user(self.store.as_ref(), actor_id).await?;
        let mut creator_doc = creator.doc;
        creator_doc.wallet_balance += bounty.reward;

        bounty.status = BountyStatus::Cancelled;
        bounty.updated_at = Utc::now();

        self.store
            .commit(vec![
                Write::put(
                    paths::bounty(bounty_id),
                    Precondition::Revision(bounty_snap.revision),
                    &bounty,
                )?,
                Write::put(
                    paths::user(actor_id),
                    Precondition::Revision(creator.revision),
                    &creator_doc,
                )?,
                TxBuilder::new(LedgerTxType::Refund, bounty.reward, &bounty.currency)
                    .to_user(actor_id)
                    .bounty(bounty_id)
                    .into_write()?,
            ])
            .await?;

        self.notifier
            .dispatch(vec![Notification::new(
                actor_id,
                NotificationKind::BountyCancelled,
                paths::bounty(bounty_id),
                "bounty cancelled, reward refunded",
            )])
            .await;
        Ok(())
    }

    /// Scheduled sweep: refund every open bounty past its expiry at the
    /// configured ratio. The retained remainder is the listing fee.
    pub async fn expire_bounties(&self) -> EngineResult<usize> {
        let raw = self
            .store
            .list_raw("bounties/")
            .await
            .map_err(EngineError::from)?;
        let now = Utc::now();

        let mut expired = 0;
        for (path, value, revision) in raw {
            // Claims and votes share the prefix.
            if path.contains("/claims/") {
                continue;
            }
            let bounty: Bounty = match serde_json::from_value(value) {
                Ok(b) => b,
                Err(e) => {
                    warn!("skipping malformed bounty doc {}: {}", path, e);
                    continue;
                }
            };
            if bounty.status != BountyStatus::Open || now <= bounty.expires_at {
                continue;
            }

            match self.expire_one(bounty, revision).await {
                Ok(true) => expired += 1,
                // Raced with a claim or another sweep; next tick catches it.
                Ok(false) => {}
                Err(e) => warn!("failed to expire bounty: {}", e),
            }
        }

        if expired > 0 {
            info!("expired {} bounties", expired);
        }
        Ok(expired)
    }

    /// Returns false when the commit lost a revision race instead of
    /// expiring the bounty.
    async fn expire_one(&self, mut bounty: Bounty, revision: u64) -> EngineResult<bool> {
        let refund = ledger::refund_amount(bounty.reward, self.policy.expiry_refund_bps);

        let creator = require_user(self.store.as_ref(), &bounty.creator_id).await?;
        let mut creator_doc = creator.doc;
        creator_doc.wallet_balance += refund;

        bounty.status = BountyStatus::Expired;
        bounty.updated_at = Utc::now();

        match self
            .store
            .commit(vec![
                Write::put(
                    paths::bounty(&bounty.id),
                    Precondition::Revision(revision),
                    &bounty,
                )?,
                Write::put(
                    paths::user(&bounty.creator_id),
                    Precondition::Revision(creator.revision),
                    &creator_doc,
                )?,
                TxBuilder::new(LedgerTxType::Refund, refund, &bounty.currency)
                    .to_user(&bounty.creator_id)
                    .bounty(&bounty.id)
                    .into_write()?,
            ])
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        info!("bounty {} expired, refunded {}", bounty.id, refund);
        self.notifier
            .dispatch(vec![Notification::new(
                &bounty.creator_id,
                NotificationKind::BountyExpired,
                paths::bounty(&bounty.id),
                format!("bounty expired, {} refunded", refund),
            )])
            .await;
        Ok(true)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn load_bounty(&self, bounty_id: &str) -> EngineResult<crate::store::Snapshot<Bounty>> {
        get_doc::<Bounty>(self.store.as_ref(), &paths::bounty(bounty_id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("bounty {}", bounty_id)))
    }

    async fn has_pending_claims(&self, bounty_id: &str) -> EngineResult<bool> {
        let prefix = format!("bounties/{}/claims/", bounty_id);
        let raw = self
            .store
            .list_raw(&prefix)
            .await
            .map_err(EngineError::from)?;
        for (path, value, _) in raw {
            if path.contains("/votes/") {
                continue;
            }
            let claim: Claim = serde_json::from_value(value).map_err(StoreError::from)?;
            if claim.status == ClaimStatus::Pending {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
