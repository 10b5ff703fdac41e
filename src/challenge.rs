//! Challenge state machine
//!
//! Two-party asynchronous battle: each side submits one clip, community
//! votes on a winner. Status moves one way only:
//! `CreatorReady -> OpponentUploading -> BothReady -> Voting -> Completed`.
//! Every transition is one revision-guarded commit, so concurrent triggers
//! (clip observers firing twice, votes racing the window) squeeze through
//! the status guard at most once.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::require_user;
use crate::config::{PolicyConfig, VideoConfig};
use crate::error::{EngineError, EngineResult};
use crate::model::{paths, Challenge, ChallengeStatus, Clip, ClipStatus};
use crate::notify::{Notification, NotificationDispatcher, NotificationKind};
use crate::ratelimit::{ActionClass, RateLimiter};
use crate::reputation;
use crate::store::{
    self, get_doc, DocumentStore, Precondition, StoreError, Write, MAX_TXN_ATTEMPTS,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ClipSubmission {
    pub storage_path: String,
    pub duration_secs: f64,
    pub thumbnail_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateChallengeResponse {
    pub challenge_id: String,
    pub status: ChallengeStatus,
}

#[derive(Debug, Serialize)]
pub struct AcceptChallengeResponse {
    pub success: bool,
    pub status: ChallengeStatus,
}

pub struct ChallengeEngine {
    store: Arc<dyn DocumentStore>,
    limiter: Arc<RateLimiter>,
    notifier: Arc<NotificationDispatcher>,
    policy: PolicyConfig,
    video: VideoConfig,
}

impl ChallengeEngine {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        limiter: Arc<RateLimiter>,
        notifier: Arc<NotificationDispatcher>,
        policy: PolicyConfig,
        video: VideoConfig,
    ) -> Self {
        Self {
            store,
            limiter,
            notifier,
            policy,
            video,
        }
    }

    fn check_declared_duration(&self, duration_secs: f64) -> EngineResult<()> {
        let tol = self.video.duration_tolerance_secs;
        if duration_secs < self.video.min_duration_secs - tol
            || duration_secs > self.video.max_duration_secs + tol
        {
            return Err(EngineError::InvalidArgument(format!(
                "clip duration {:.1}s outside allowed {:.1}-{:.1}s",
                duration_secs, self.video.min_duration_secs, self.video.max_duration_secs
            )));
        }
        Ok(())
    }

    fn new_clip(&self, owner_id: &str, submission: &ClipSubmission) -> Clip {
        Clip {
            owner_id: owner_id.to_string(),
            storage_path: submission.storage_path.clone(),
            declared_duration_secs: submission.duration_secs,
            status: ClipStatus::PendingUpload,
            rejection_reason: None,
            metadata: None,
            thumbnail_path: submission.thumbnail_path.clone(),
            updated_at: Utc::now(),
        }
    }

    // ========================================================================
    // RPC OPERATIONS
    // ========================================================================

    pub async fn create_challenge(
        &self,
        actor_id: &str,
        opponent_id: &str,
        clip: ClipSubmission,
    ) -> EngineResult<CreateChallengeResponse> {
        require_user(self.store.as_ref(), actor_id).await?;
        if actor_id == opponent_id {
            return Err(EngineError::InvalidArgument(
                "cannot challenge yourself".into(),
            ));
        }
        require_user(self.store.as_ref(), opponent_id).await?;
        self.check_declared_duration(clip.duration_secs)?;

        self.limiter
            .check_and_update(actor_id, ActionClass::ChallengeCreate)
            .await?;

        let now = Utc::now();
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            creator_id: actor_id.to_string(),
            opponent_id: opponent_id.to_string(),
            status: ChallengeStatus::CreatorReady,
            votes: Default::default(),
            creator_votes: 0,
            opponent_votes: 0,
            deadline: now + Duration::hours(self.policy.challenge_deadline_hours),
            voting_ends_at: None,
            winner: None,
            created_at: now,
            updated_at: now,
        };

        self.store
            .commit(vec![
                Write::put(
                    paths::challenge(&challenge.id),
                    Precondition::NotExists,
                    &challenge,
                )?,
                Write::put(
                    paths::clip(&challenge.id, actor_id),
                    Precondition::NotExists,
                    &self.new_clip(actor_id, &clip),
                )?,
            ])
            .await?;

        info!(
            "challenge {} created by {} vs {}",
            challenge.id, actor_id, opponent_id
        );
        self.notifier
            .dispatch(vec![Notification::new(
                opponent_id,
                NotificationKind::ChallengeReceived,
                paths::challenge(&challenge.id),
                format!("{} challenged you to a battle", actor_id),
            )])
            .await;

        Ok(CreateChallengeResponse {
            challenge_id: challenge.id,
            status: ChallengeStatus::CreatorReady,
        })
    }

    pub async fn accept_challenge(
        &self,
        actor_id: &str,
        challenge_id: &str,
        clip: ClipSubmission,
    ) -> EngineResult<AcceptChallengeResponse> {
        require_user(self.store.as_ref(), actor_id).await?;
        self.check_declared_duration(clip.duration_secs)?;

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let snap = get_doc::<Challenge>(self.store.as_ref(), &paths::challenge(challenge_id))
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("challenge {}", challenge_id)))?;

            let mut challenge = snap.doc;
            if challenge.opponent_id != actor_id {
                return Err(EngineError::PermissionDenied(
                    "only the challenged opponent can accept".into(),
                ));
            }
            if challenge.status != ChallengeStatus::CreatorReady {
                return Err(EngineError::FailedPrecondition(format!(
                    "challenge is not awaiting acceptance (status {:?})",
                    challenge.status
                )));
            }
            if Utc::now() > challenge.deadline {
                return Err(EngineError::DeadlineExceeded(
                    "acceptance deadline has passed".into(),
                ));
            }

            challenge.status = ChallengeStatus::OpponentUploading;
            challenge.updated_at = Utc::now();

            let writes = vec![
                Write::put(
                    paths::challenge(challenge_id),
                    Precondition::Revision(snap.revision),
                    &challenge,
                )?,
                Write::put(
                    paths::clip(challenge_id, actor_id),
                    Precondition::NotExists,
                    &self.new_clip(actor_id, &clip),
                )?,
            ];

            match self.store.commit(writes).await {
                Ok(()) => {
                    info!("challenge {} accepted by {}", challenge_id, actor_id);
                    self.notifier
                        .dispatch(vec![Notification::new(
                            &challenge.creator_id,
                            NotificationKind::ChallengeAccepted,
                            paths::challenge(challenge_id),
                            format!("{} accepted your challenge", actor_id),
                        )])
                        .await;
                    return Ok(AcceptChallengeResponse {
                        success: true,
                        status: ChallengeStatus::OpponentUploading,
                    });
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal("challenge accept contention".into()))
    }

    /// Re-submit after a validation rejection. The challenge itself stays
    /// in its pre-ready state; only the rejected clip resets.
    pub async fn resubmit_clip(
        &self,
        actor_id: &str,
        challenge_id: &str,
        clip: ClipSubmission,
    ) -> EngineResult<()> {
        require_user(self.store.as_ref(), actor_id).await?;
        self.check_declared_duration(clip.duration_secs)?;

        let challenge_snap =
            get_doc::<Challenge>(self.store.as_ref(), &paths::challenge(challenge_id))
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("challenge {}", challenge_id)))?;
        if !challenge_snap.doc.is_participant(actor_id) {
            return Err(EngineError::PermissionDenied(
                "not a participant of this challenge".into(),
            ));
        }
        if challenge_snap.doc.status == ChallengeStatus::Completed {
            return Err(EngineError::FailedPrecondition(
                "challenge already completed".into(),
            ));
        }

        let clip_path = paths::clip(challenge_id, actor_id);
        let clip_snap = get_doc::<Clip>(self.store.as_ref(), &clip_path)
            .await?
            .ok_or_else(|| EngineError::NotFound("clip".into()))?;
        if clip_snap.doc.status != ClipStatus::Rejected {
            return Err(EngineError::FailedPrecondition(
                "only a rejected clip can be re-submitted".into(),
            ));
        }

        self.store
            .commit(vec![Write::put(
                &clip_path,
                Precondition::Revision(clip_snap.revision),
                &self.new_clip(actor_id, &clip),
            )?])
            .await?;
        Ok(())
    }

    // ========================================================================
    // BOTH-READY DETECTION
    // ========================================================================

    /// Idempotent observer entry point: open the voting window once both
    /// clips are ready. Safe under concurrent double-fire: the status
    /// guard plus the revision precondition let only one invocation through.
    pub async fn try_open_voting(&self, challenge_id: &str) -> EngineResult<bool> {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let snap = get_doc::<Challenge>(self.store.as_ref(), &paths::challenge(challenge_id))
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("challenge {}", challenge_id)))?;

            let mut challenge = snap.doc;
            if matches!(
                challenge.status,
                ChallengeStatus::BothReady | ChallengeStatus::Voting | ChallengeStatus::Completed
            ) {
                return Ok(false);
            }

            let creator_clip = get_doc::<Clip>(
                self.store.as_ref(),
                &paths::clip(challenge_id, &challenge.creator_id),
            )
            .await?;
            let opponent_clip = get_doc::<Clip>(
                self.store.as_ref(),
                &paths::clip(challenge_id, &challenge.opponent_id),
            )
            .await?;

            let both_ready = matches!(
                (&creator_clip, &opponent_clip),
                (Some(c), Some(o))
                    if c.doc.status == ClipStatus::Ready && o.doc.status == ClipStatus::Ready
            );
            if !both_ready {
                return Ok(false);
            }

            challenge.status = ChallengeStatus::BothReady;
            challenge.voting_ends_at =
                Some(Utc::now() + Duration::hours(self.policy.voting_window_hours));
            challenge.votes.clear();
            challenge.creator_votes = 0;
            challenge.opponent_votes = 0;
            challenge.updated_at = Utc::now();

            match self
                .store
                .commit(vec![Write::put(
                    paths::challenge(challenge_id),
                    Precondition::Revision(snap.revision),
                    &challenge,
                )?])
                .await
            {
                Ok(()) => {
                    info!("challenge {} voting window opened", challenge_id);
                    let subject = paths::challenge(challenge_id);
                    self.notifier
                        .dispatch(
                            challenge
                                .participants()
                                .iter()
                                .map(|p| {
                                    Notification::new(
                                        *p,
                                        NotificationKind::VotingOpened,
                                        subject.clone(),
                                        "both clips are in, voting is open",
                                    )
                                })
                                .collect(),
                        )
                        .await;
                    return Ok(true);
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Somebody else kept winning the race; their commit did the work.
        Ok(false)
    }

    // ========================================================================
    // VOTING & SETTLEMENT
    // ========================================================================

    pub async fn cast_vote(
        &self,
        actor_id: &str,
        challenge_id: &str,
        voted_for: &str,
    ) -> EngineResult<()> {
        let voter = require_user(self.store.as_ref(), actor_id).await?;
        reputation::ensure_can_vote(&voter.doc, &self.policy)?;

        self.limiter
            .check_and_update(actor_id, ActionClass::VoteCast)
            .await?;

        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let snap = get_doc::<Challenge>(self.store.as_ref(), &paths::challenge(challenge_id))
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("challenge {}", challenge_id)))?;

            let mut challenge = snap.doc;
            if challenge.is_participant(actor_id) {
                return Err(EngineError::PermissionDenied(
                    "participants cannot vote on their own battle".into(),
                ));
            }
            if !challenge.is_participant(voted_for) {
                return Err(EngineError::InvalidArgument(
                    "vote target is not a participant".into(),
                ));
            }
            if !matches!(
                challenge.status,
                ChallengeStatus::BothReady | ChallengeStatus::Voting
            ) {
                return Err(EngineError::FailedPrecondition(format!(
                    "challenge is not accepting votes (status {:?})",
                    challenge.status
                )));
            }
            if let Some(ends) = challenge.voting_ends_at {
                if Utc::now() > ends {
                    return Err(EngineError::DeadlineExceeded(
                        "voting window has closed".into(),
                    ));
                }
            }
            if challenge.votes.contains_key(actor_id) {
                return Err(EngineError::FailedPrecondition(
                    "already voted on this challenge".into(),
                ));
            }

            challenge
                .votes
                .insert(actor_id.to_string(), voted_for.to_string());
            if voted_for == challenge.creator_id {
                challenge.creator_votes += 1;
            } else {
                challenge.opponent_votes += 1;
            }
            challenge.status = ChallengeStatus::Voting;

            // Quorum settles immediately, inside the same commit.
            let quorum_reached = challenge.creator_votes + challenge.opponent_votes
                >= self.policy.challenge_vote_quorum;
            if quorum_reached {
                Self::complete(&mut challenge);
            }
            challenge.updated_at = Utc::now();

            match self
                .store
                .commit(vec![Write::put(
                    paths::challenge(challenge_id),
                    Precondition::Revision(snap.revision),
                    &challenge,
                )?])
                .await
            {
                Ok(()) => {
                    if quorum_reached {
                        self.announce_result(&challenge).await;
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

    /// Winner computation. Equal tallies are a draw: completed with no
    /// winner, both sides notified.
    fn complete(challenge: &mut Challenge) {
        challenge.winner = match challenge.creator_votes.cmp(&challenge.opponent_votes) {
            std::cmp::Ordering::Greater => Some(challenge.creator_id.clone()),
            std::cmp::Ordering::Less => Some(challenge.opponent_id.clone()),
            std::cmp::Ordering::Equal => None,
        };
        challenge.status = ChallengeStatus::Completed;
    }

    async fn announce_result(&self, challenge: &Challenge) {
        let body = match &challenge.winner {
            Some(winner) => format!("battle settled, {} takes it", winner),
            None => "battle settled as a draw".to_string(),
        };
        let subject = paths::challenge(&challenge.id);
        self.notifier
            .dispatch(
                challenge
                    .participants()
                    .iter()
                    .map(|p| {
                        Notification::new(
                            *p,
                            NotificationKind::ChallengeCompleted,
                            subject.clone(),
                            body.clone(),
                        )
                    })
                    .collect(),
            )
            .await;
    }

    /// Settle one challenge whose voting window has elapsed.
    pub async fn settle_challenge(&self, challenge_id: &str) -> EngineResult<bool> {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let snap = get_doc::<Challenge>(self.store.as_ref(), &paths::challenge(challenge_id))
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("challenge {}", challenge_id)))?;

            let mut challenge = snap.doc;
            if !matches!(
                challenge.status,
                ChallengeStatus::BothReady | ChallengeStatus::Voting
            ) {
                return Ok(false);
            }
            let window_elapsed = challenge
                .voting_ends_at
                .map(|ends| Utc::now() > ends)
                .unwrap_or(false);
            if !window_elapsed {
                return Err(EngineError::FailedPrecondition(
                    "voting window still open".into(),
                ));
            }

            Self::complete(&mut challenge);
            challenge.updated_at = Utc::now();

            match self
                .store
                .commit(vec![Write::put(
                    paths::challenge(challenge_id),
                    Precondition::Revision(snap.revision),
                    &challenge,
                )?])
                .await
            {
                Ok(()) => {
                    info!(
                        "challenge {} settled, winner: {:?}",
                        challenge_id, challenge.winner
                    );
                    self.announce_result(&challenge).await;
                    return Ok(true);
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(false)
    }

    /// Scheduled sweep: settle every challenge whose window has elapsed.
    pub async fn settle_due_challenges(&self) -> EngineResult<usize> {
        let raw = self
            .store
            .list_raw("challenges/")
            .await
            .map_err(EngineError::from)?;
        let now = Utc::now();

        let mut settled = 0;
        for (path, value, _) in raw {
            // Skip clip sub-documents picked up by the prefix.
            if path.contains("/clips/") {
                continue;
            }
            let challenge: Challenge = match serde_json::from_value(value) {
                Ok(c) => c,
                Err(e) => {
                    warn!("skipping malformed challenge doc {}: {}", path, e);
                    continue;
                }
            };
            let due = matches!(
                challenge.status,
                ChallengeStatus::BothReady | ChallengeStatus::Voting
            ) && challenge.voting_ends_at.map(|e| now > e).unwrap_or(false);
            if !due {
                continue;
            }
            match self.settle_challenge(&challenge.id).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => warn!("failed to settle challenge {}: {}", challenge.id, e),
            }
        }
        Ok(settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::UserProfile;
    use crate::notify::MemorySink;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: ChallengeEngine,
        sink: Arc<MemorySink>,
    }

    async fn fixture() -> Fixture {
        let config = Config::default();
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.limits.clone()));
        let sink = Arc::new(MemorySink::new());
        let notifier = Arc::new(NotificationDispatcher::new().with_sink(sink.clone()));
        let engine = ChallengeEngine::new(
            store.clone(),
            limiter,
            notifier,
            config.policy.clone(),
            config.video.clone(),
        );

        for user in ["ana", "bo", "v1", "v2", "v3"] {
            let profile = UserProfile::new(user, config.policy.reputation_baseline);
            store
                .commit(vec![
                    Write::put(paths::user(user), Precondition::NotExists, &profile).unwrap(),
                ])
                .await
                .unwrap();
        }

        Fixture {
            store,
            engine,
            sink,
        }
    }

    fn clip(path: &str) -> ClipSubmission {
        ClipSubmission {
            storage_path: path.to_string(),
            duration_secs: 10.0,
            thumbnail_path: None,
        }
    }

    async fn mark_clip_ready(store: &MemoryStore, challenge_id: &str, user_id: &str) {
        let path = paths::clip(challenge_id, user_id);
        let snap = get_doc::<Clip>(store, &path).await.unwrap().unwrap();
        let mut clip = snap.doc;
        clip.status = ClipStatus::Ready;
        store
            .commit(vec![
                Write::put(&path, Precondition::Revision(snap.revision), &clip).unwrap(),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_accept_flow() {
        let f = fixture().await;
        let created = f
            .engine
            .create_challenge("ana", "bo", clip("challenges/drafts/ana/a.mp4"))
            .await
            .unwrap();
        assert_eq!(created.status, ChallengeStatus::CreatorReady);

        // Only the designated opponent may accept.
        let err = f
            .engine
            .accept_challenge("v1", &created.challenge_id, clip("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PermissionDenied(_)));

        let accepted = f
            .engine
            .accept_challenge("bo", &created.challenge_id, clip("challenges/drafts/bo/b.mp4"))
            .await
            .unwrap();
        assert_eq!(accepted.status, ChallengeStatus::OpponentUploading);

        // Double-accept hits the status guard.
        let err = f
            .engine
            .accept_challenge("bo", &created.challenge_id, clip("y"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn test_self_challenge_and_bad_duration_rejected() {
        let f = fixture().await;
        assert!(matches!(
            f.engine.create_challenge("ana", "ana", clip("p")).await,
            Err(EngineError::InvalidArgument(_))
        ));

        let mut short = clip("p");
        short.duration_secs = 4.9;
        assert!(matches!(
            f.engine.create_challenge("ana", "bo", short).await,
            Err(EngineError::InvalidArgument(_))
        ));

        let mut long = clip("p");
        long.duration_secs = 15.6;
        assert!(matches!(
            f.engine.create_challenge("ana", "bo", long).await,
            Err(EngineError::InvalidArgument(_))
        ));

        let mut edge = clip("p");
        edge.duration_secs = 15.5;
        assert!(f.engine.create_challenge("ana", "bo", edge).await.is_ok());
    }

    #[tokio::test]
    async fn test_accept_after_deadline_is_rejected_without_state_change() {
        let f = fixture().await;
        let created = f
            .engine
            .create_challenge("ana", "bo", clip("a"))
            .await
            .unwrap();

        // Force the deadline into the past.
        let path = paths::challenge(&created.challenge_id);
        let snap = get_doc::<Challenge>(f.store.as_ref(), &path)
            .await
            .unwrap()
            .unwrap();
        let mut challenge = snap.doc;
        challenge.deadline = Utc::now() - Duration::hours(1);
        f.store
            .commit(vec![
                Write::put(&path, Precondition::Revision(snap.revision), &challenge).unwrap(),
            ])
            .await
            .unwrap();

        let err = f
            .engine
            .accept_challenge("bo", &created.challenge_id, clip("b"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DeadlineExceeded(_)));

        let after = get_doc::<Challenge>(f.store.as_ref(), &path)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.doc.status, ChallengeStatus::CreatorReady);
    }

    #[tokio::test]
    async fn test_both_ready_detection_is_idempotent() {
        let f = fixture().await;
        let created = f
            .engine
            .create_challenge("ana", "bo", clip("a"))
            .await
            .unwrap();
        let id = created.challenge_id;
        f.engine.accept_challenge("bo", &id, clip("b")).await.unwrap();

        // One clip ready: no transition yet.
        mark_clip_ready(f.store.as_ref(), &id, "ana").await;
        assert!(!f.engine.try_open_voting(&id).await.unwrap());

        mark_clip_ready(f.store.as_ref(), &id, "bo").await;
        assert!(f.engine.try_open_voting(&id).await.unwrap());

        // Replayed observer fire is absorbed by the status guard.
        assert!(!f.engine.try_open_voting(&id).await.unwrap());

        let challenge = get_doc::<Challenge>(f.store.as_ref(), &paths::challenge(&id))
            .await
            .unwrap()
            .unwrap()
            .doc;
        assert_eq!(challenge.status, ChallengeStatus::BothReady);
        assert!(challenge.voting_ends_at.is_some());
    }

    async fn open_voting(f: &Fixture) -> String {
        let created = f
            .engine
            .create_challenge("ana", "bo", clip("a"))
            .await
            .unwrap();
        let id = created.challenge_id;
        f.engine.accept_challenge("bo", &id, clip("b")).await.unwrap();
        mark_clip_ready(f.store.as_ref(), &id, "ana").await;
        mark_clip_ready(f.store.as_ref(), &id, "bo").await;
        f.engine.try_open_voting(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_voting_rules() {
        let f = fixture().await;
        let id = open_voting(&f).await;

        // Participants cannot vote on their own battle.
        assert!(matches!(
            f.engine.cast_vote("ana", &id, "ana").await,
            Err(EngineError::PermissionDenied(_))
        ));

        f.engine.cast_vote("v1", &id, "ana").await.unwrap();

        // One vote per voter.
        assert!(matches!(
            f.engine.cast_vote("v1", &id, "bo").await,
            Err(EngineError::FailedPrecondition(_))
        ));

        let challenge = get_doc::<Challenge>(f.store.as_ref(), &paths::challenge(&id))
            .await
            .unwrap()
            .unwrap()
            .doc;
        assert_eq!(challenge.status, ChallengeStatus::Voting);
        assert_eq!(challenge.creator_votes, 1);
    }

    #[tokio::test]
    async fn test_settlement_winner_and_tie_draw() {
        let f = fixture().await;
        let id = open_voting(&f).await;
        f.engine.cast_vote("v1", &id, "ana").await.unwrap();
        f.engine.cast_vote("v2", &id, "bo").await.unwrap();

        // Window still open: settling is premature.
        assert!(matches!(
            f.engine.settle_challenge(&id).await,
            Err(EngineError::FailedPrecondition(_))
        ));

        // Close the window with a tied tally: draw.
        let path = paths::challenge(&id);
        let snap = get_doc::<Challenge>(f.store.as_ref(), &path)
            .await
            .unwrap()
            .unwrap();
        let mut challenge = snap.doc;
        challenge.voting_ends_at = Some(Utc::now() - Duration::hours(1));
        f.store
            .commit(vec![
                Write::put(&path, Precondition::Revision(snap.revision), &challenge).unwrap(),
            ])
            .await
            .unwrap();

        assert!(f.engine.settle_challenge(&id).await.unwrap());
        let settled = get_doc::<Challenge>(f.store.as_ref(), &path)
            .await
            .unwrap()
            .unwrap()
            .doc;
        assert_eq!(settled.status, ChallengeStatus::Completed);
        assert_eq!(settled.winner, None);

        // Result notifications reached both sides.
        let recipients: Vec<_> = f
            .sink
            .delivered()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::ChallengeCompleted)
            .map(|n| n.recipient)
            .collect();
        assert!(recipients.contains(&"ana".to_string()));
        assert!(recipients.contains(&"bo".to_string()));

        // Settling again is a no-op.
        assert!(!f.engine.settle_challenge(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_settles_due_challenges() {
        let f = fixture().await;
        let id = open_voting(&f).await;
        f.engine.cast_vote("v1", &id, "bo").await.unwrap();

        let path = paths::challenge(&id);
        let snap = get_doc::<Challenge>(f.store.as_ref(), &path)
            .await
            .unwrap()
            .unwrap();
        let mut challenge = snap.doc;
        challenge.voting_ends_at = Some(Utc::now() - Duration::minutes(5));
        f.store
            .commit(vec![
                Write::put(&path, Precondition::Revision(snap.revision), &challenge).unwrap(),
            ])
            .await
            .unwrap();

        assert_eq!(f.engine.settle_due_challenges().await.unwrap(), 1);
        let settled = get_doc::<Challenge>(f.store.as_ref(), &path)
            .await
            .unwrap()
            .unwrap()
            .doc;
        assert_eq!(settled.winner, Some("bo".to_string()));
    }
}
