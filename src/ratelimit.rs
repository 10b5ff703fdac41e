//! Per-actor, per-action rate limiting
//!
//! Counters live in the shared document store, not process memory: handlers
//! run on arbitrary concurrent instances, so the increment has to be a
//! revision-guarded read-modify-write. Windows are fixed: the counter
//! resets to 1 on the first call after the window elapses.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{LimitsConfig, RateLimitRule};
use crate::error::{EngineError, EngineResult};
use crate::model::{paths, RateLimitCounter};
use crate::store::{
    self, get_doc, DocumentStore, Precondition, StoreError, Write, MAX_TXN_ATTEMPTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionClass {
    ChallengeCreate,
    BountyCreate,
    ClaimSubmit,
    VoteCast,
}

impl ActionClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionClass::ChallengeCreate => "challenge_create",
            ActionClass::BountyCreate => "bounty_create",
            ActionClass::ClaimSubmit => "claim_submit",
            ActionClass::VoteCast => "vote_cast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "challenge_create" => Some(ActionClass::ChallengeCreate),
            "bounty_create" => Some(ActionClass::BountyCreate),
            "claim_submit" => Some(ActionClass::ClaimSubmit),
            "vote_cast" => Some(ActionClass::VoteCast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub current_count: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    store: Arc<dyn DocumentStore>,
    limits: LimitsConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn DocumentStore>, limits: LimitsConfig) -> Self {
        Self { store, limits }
    }

    fn rule(&self, action: ActionClass) -> RateLimitRule {
        match action {
            ActionClass::ChallengeCreate => self.limits.challenge_create,
            ActionClass::BountyCreate => self.limits.bounty_create,
            ActionClass::ClaimSubmit => self.limits.claim_submit,
            ActionClass::VoteCast => self.limits.vote_cast,
        }
    }

    /// Transactional check-and-increment. Returns the updated status when
    /// allowed; `ResourceExhausted` without incrementing when the window is
    /// full.
    pub async fn check_and_update(
        &self,
        actor: &str,
        action: ActionClass,
    ) -> EngineResult<RateLimitStatus> {
        let rule = self.rule(action);
        let window = Duration::seconds(rule.window_secs);
        let path = paths::rate_limit(actor, action.as_str());

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let now = Utc::now();
            let existing = get_doc::<RateLimitCounter>(self.store.as_ref(), &path).await?;

            let (counter, precondition) = match existing {
                None => (
                    RateLimitCounter {
                        count: 1,
                        window_start: now,
                        last_touched: now,
                    },
                    Precondition::NotExists,
                ),
                Some(snap) if now - snap.doc.window_start >= window => (
                    // Window elapsed: reset to 1.
                    RateLimitCounter {
                        count: 1,
                        window_start: now,
                        last_touched: now,
                    },
                    Precondition::Revision(snap.revision),
                ),
                Some(snap) if snap.doc.count >= rule.max => {
                    let reset_at = snap.doc.window_start + window;
                    debug!(
                        "rate limit hit for {} on {} ({}/{})",
                        actor,
                        action.as_str(),
                        snap.doc.count,
                        rule.max
                    );
                    return Err(EngineError::ResourceExhausted(format!(
                        "{} limit of {} reached, resets at {}",
                        action.as_str(),
                        rule.max,
                        reset_at
                    )));
                }
                Some(snap) => (
                    RateLimitCounter {
                        count: snap.doc.count + 1,
                        window_start: snap.doc.window_start,
                        last_touched: now,
                    },
                    Precondition::Revision(snap.revision),
                ),
            };

            let status = RateLimitStatus {
                allowed: true,
                current_count: counter.count,
                remaining: rule.max.saturating_sub(counter.count),
                reset_at: counter.window_start + window,
            };

            match self
                .store
                .commit(vec![Write::put(&path, precondition, &counter)?])
                .await
            {
                Ok(()) => return Ok(status),
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal(format!(
            "rate limit counter contention for {}",
            actor
        )))
    }

    /// Read-only status. Never mutates the counter.
    pub async fn status(&self, actor: &str, action: ActionClass) -> EngineResult<RateLimitStatus> {
        let rule = self.rule(action);
        let window = Duration::seconds(rule.window_secs);
        let path = paths::rate_limit(actor, action.as_str());
        let now = Utc::now();

        match get_doc::<RateLimitCounter>(self.store.as_ref(), &path).await? {
            Some(snap) if now - snap.doc.window_start < window => Ok(RateLimitStatus {
                allowed: snap.doc.count < rule.max,
                current_count: snap.doc.count,
                remaining: rule.max.saturating_sub(snap.doc.count),
                reset_at: snap.doc.window_start + window,
            }),
            // No counter, or the window already elapsed.
            _ => Ok(RateLimitStatus {
                allowed: true,
                current_count: 0,
                remaining: rule.max,
                reset_at: now + window,
            }),
        }
    }

    /// Garbage-collect counters untouched past the retention window. Pure
    /// cleanup, no business effect.
    pub async fn sweep_stale(&self) -> EngineResult<usize> {
        let cutoff = Utc::now() - Duration::days(self.limits.counter_retention_days);
        let counters =
            store::list_docs::<RateLimitCounter>(self.store.as_ref(), "rate_limits/").await?;

        let mut removed = 0;
        for (path, snap) in counters {
            if snap.doc.last_touched < cutoff {
                match self
                    .store
                    .commit(vec![Write::delete(&path, Precondition::Revision(snap.revision))])
                    .await
                {
                    Ok(()) => removed += 1,
                    // Touched since we listed it; leave it alone.
                    Err(StoreError::Conflict(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if removed > 0 {
            info!("swept {} stale rate limit counters", removed);
        }
        Ok(removed)
    }
}
