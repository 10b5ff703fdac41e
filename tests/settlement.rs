//! End-to-end settlement flows through the public engine APIs: a full
//! challenge from creation to a settled result, and a full bounty from
//! hold to payout, wired the way the server wires them.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::Mutex;

use skate_settlement::auth::require_user;
use skate_settlement::challenge::ClipSubmission;
use skate_settlement::bounty::{CreateBountyRequest, SubmitClaimRequest};
use skate_settlement::config::Config;
use skate_settlement::events::{ClipStatusObserver, DocUpdate, ObserverHub};
use skate_settlement::ledger;
use skate_settlement::model::{
    paths, Bounty, BountyStatus, Challenge, ChallengeStatus, Claim, ClaimStatus, LedgerTxType,
    UserProfile, VideoMetadata,
};
use skate_settlement::notify::NotificationDispatcher;
use skate_settlement::store::{get_doc, Precondition, Write};
use skate_settlement::video::{BlobStore, FinalizeEvent, PipelineOutcome, VideoProbe};
use skate_settlement::{
    BountyEngine, ChallengeEngine, DocumentStore, MemoryStore, RateLimiter, VideoPipeline,
};

struct StubBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl StubBlobStore {
    fn new() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, path: &str) {
        self.blobs.lock().insert(path.to_string(), b"clip".to_vec());
    }
}

#[async_trait]
impl BlobStore for StubBlobStore {
    async fn download(&self, path: &str, dest: &Path) -> anyhow::Result<()> {
        let bytes = self
            .blobs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("blob not found"))?;
        std::fs::write(dest, bytes)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.blobs.lock().remove(path);
        Ok(())
    }
}

struct StubProbe {
    duration_secs: f64,
}

#[async_trait]
impl VideoProbe for StubProbe {
    async fn probe(&self, _file: &Path) -> anyhow::Result<VideoMetadata> {
        Ok(VideoMetadata {
            duration_secs: self.duration_secs,
            width: 1080,
            height: 1920,
            codec: "h264".into(),
        })
    }
}

struct Stack {
    store: Arc<MemoryStore>,
    challenges: Arc<ChallengeEngine>,
    bounties: Arc<BountyEngine>,
    pipeline: Arc<VideoPipeline>,
    blobs: Arc<StubBlobStore>,
    hub: Arc<ObserverHub>,
}

async fn stack(probe_duration: f64) -> Stack {
    let config = Config::default();
    let store = Arc::new(MemoryStore::new());
    let limiter = Arc::new(RateLimiter::new(store.clone(), config.limits.clone()));
    let notifier = Arc::new(NotificationDispatcher::new());
    let challenges = Arc::new(ChallengeEngine::new(
        store.clone(),
        limiter.clone(),
        notifier.clone(),
        config.policy.clone(),
        config.video.clone(),
    ));
    let bounties = Arc::new(BountyEngine::new(
        store.clone(),
        limiter.clone(),
        notifier.clone(),
        config.policy.clone(),
    ));
    let blobs = Arc::new(StubBlobStore::new());
    let pipeline = Arc::new(VideoPipeline::new(
        store.clone(),
        blobs.clone(),
        Arc::new(StubProbe {
            duration_secs: probe_duration,
        }),
        notifier,
        config.video.clone(),
    ));
    let hub = Arc::new(
        ObserverHub::new().with_observer(Arc::new(ClipStatusObserver::new(challenges.clone()))),
    );

    Stack {
        store,
        challenges,
        bounties,
        pipeline,
        blobs,
        hub,
    }
}

async fn seed_user(store: &MemoryStore, id: &str, balance: u64) {
    let mut profile = UserProfile::new(id, 50);
    profile.wallet_balance = balance;
    store
        .commit(vec![
            Write::put(paths::user(id), Precondition::NotExists, &profile).unwrap(),
        ])
        .await
        .unwrap();
}

fn clip(path: &str) -> ClipSubmission {
    ClipSubmission {
        storage_path: path.to_string(),
        duration_secs: 10.0,
        thumbnail_path: None,
    }
}

/// Runs a finalize event the way the server route does: capture the clip
/// document around the pipeline run and fan the change out to observers.
async fn deliver_finalize(stack: &Stack, challenge_id: &str, user_id: &str) -> PipelineOutcome {
    let storage_path = format!("challenges/{}/{}/run.mp4", challenge_id, user_id);
    stack.blobs.insert(&storage_path);
    let event = FinalizeEvent {
        path: storage_path,
        size: 1024,
        content_type: "video/mp4".into(),
        generation: 1,
        metageneration: 1,
    };

    let clip_path = paths::clip(challenge_id, user_id);
    let before = stack.store.get_raw(&clip_path).await.unwrap();
    let outcome = stack.pipeline.handle_finalize(&event).await.unwrap();
    let after = stack.store.get_raw(&clip_path).await.unwrap();
    stack
        .hub
        .notify(DocUpdate {
            path: clip_path,
            before: before.map(|(doc, _)| doc),
            after: after.map(|(doc, _)| doc),
        })
        .await;
    outcome
}

async fn challenge_doc(store: &MemoryStore, id: &str) -> Challenge {
    get_doc::<Challenge>(store, &paths::challenge(id))
        .await
        .unwrap()
        .unwrap()
        .doc
}

#[tokio::test]
async fn challenge_flow_from_creation_to_draw() {
    let s = stack(10.0).await;
    seed_user(s.store.as_ref(), "creator", 0).await;
    seed_user(s.store.as_ref(), "opponent", 0).await;
    for i in 0..4 {
        seed_user(s.store.as_ref(), &format!("voter{}", i), 0).await;
    }

    let created = s
        .challenges
        .create_challenge("creator", "opponent", clip("pending"))
        .await
        .unwrap();
    let id = created.challenge_id;
    assert_eq!(created.status, ChallengeStatus::CreatorReady);

    s.challenges
        .accept_challenge("opponent", &id, clip("pending"))
        .await
        .unwrap();

    // First clip ready does not open voting; the second does, via the
    // observer.
    assert_eq!(
        deliver_finalize(&s, &id, "creator").await,
        PipelineOutcome::Valid
    );
    assert_eq!(
        challenge_doc(s.store.as_ref(), &id).await.status,
        ChallengeStatus::OpponentUploading
    );
    assert_eq!(
        deliver_finalize(&s, &id, "opponent").await,
        PipelineOutcome::Valid
    );
    let ch = challenge_doc(s.store.as_ref(), &id).await;
    assert_eq!(ch.status, ChallengeStatus::BothReady);
    assert!(ch.voting_ends_at.is_some());

    // Two votes a side.
    s.challenges.cast_vote("voter0", &id, "creator").await.unwrap();
    s.challenges.cast_vote("voter1", &id, "creator").await.unwrap();
    s.challenges.cast_vote("voter2", &id, "opponent").await.unwrap();
    s.challenges.cast_vote("voter3", &id, "opponent").await.unwrap();
    assert_eq!(
        challenge_doc(s.store.as_ref(), &id).await.status,
        ChallengeStatus::Voting
    );

    // Close the window, then settle: a draw.
    let path = paths::challenge(&id);
    let snap = get_doc::<Challenge>(s.store.as_ref(), &path)
        .await
        .unwrap()
        .unwrap();
    let mut doc = snap.doc;
    doc.voting_ends_at = Some(Utc::now() - Duration::minutes(1));
    s.store
        .commit(vec![
            Write::put(&path, Precondition::Revision(snap.revision), &doc).unwrap(),
        ])
        .await
        .unwrap();

    assert!(s.challenges.settle_challenge(&id).await.unwrap());
    let settled = challenge_doc(s.store.as_ref(), &id).await;
    assert_eq!(settled.status, ChallengeStatus::Completed);
    assert_eq!(settled.winner, None);
}

#[tokio::test]
async fn replayed_finalize_changes_clip_exactly_once() {
    let s = stack(10.0).await;
    seed_user(s.store.as_ref(), "creator", 0).await;
    seed_user(s.store.as_ref(), "opponent", 0).await;

    let id = s
        .challenges
        .create_challenge("creator", "opponent", clip("pending"))
        .await
        .unwrap()
        .challenge_id;

    assert_eq!(
        deliver_finalize(&s, &id, "creator").await,
        PipelineOutcome::Valid
    );
    assert_eq!(
        deliver_finalize(&s, &id, "creator").await,
        PipelineOutcome::Duplicate
    );

    // Exactly one idempotency record under the prefix.
    let records = s.store.list_raw("processed_videos/").await.unwrap();
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn bounty_flow_from_hold_to_payout() {
    let s = stack(10.0).await;
    seed_user(s.store.as_ref(), "owner", 2000).await;
    seed_user(s.store.as_ref(), "skater", 0).await;
    seed_user(s.store.as_ref(), "filmer", 0).await;
    for i in 0..5 {
        seed_user(s.store.as_ref(), &format!("voter{}", i), 0).await;
    }
    let mut admin = UserProfile::new("admin", 50);
    admin.roles.push(skate_settlement::model::Role::Admin);
    s.store
        .commit(vec![
            Write::put(paths::user("admin"), Precondition::NotExists, &admin).unwrap(),
        ])
        .await
        .unwrap();

    let bounty_id = s
        .bounties
        .create_bounty(
            "owner",
            CreateBountyRequest {
                spot_id: "spot-rail".into(),
                trick_description: "nollie flip crook".into(),
                reward: 1000,
                expires_at: Utc::now() + Duration::days(30),
                rules: None,
            },
        )
        .await
        .unwrap()
        .bounty_id;
    assert_eq!(
        require_user(s.store.as_ref(), "owner")
            .await
            .unwrap()
            .doc
            .wallet_balance,
        1000
    );

    s.bounties
        .submit_claim(
            "skater",
            &bounty_id,
            SubmitClaimRequest {
                clip_storage_path: "bounty-clips/skater/try.mp4".into(),
                duration_secs: 9.0,
                filmer_id: Some("filmer".into()),
            },
        )
        .await
        .unwrap();
    s.bounties
        .confirm_filmer_tag("filmer", &bounty_id, "skater", true)
        .await
        .unwrap();

    // 3 approve / 2 reject crosses the 60% quorum at 5 votes.
    for (i, approve) in [true, true, false, false, true].iter().enumerate() {
        s.bounties
            .cast_vote(&format!("voter{}", i), &bounty_id, "skater", *approve, None)
            .await
            .unwrap();
    }

    let bounty = get_doc::<Bounty>(s.store.as_ref(), &paths::bounty(&bounty_id))
        .await
        .unwrap()
        .unwrap()
        .doc;
    assert_eq!(bounty.status, BountyStatus::Locked);

    s.bounties
        .pay_out_claim("admin", &bounty_id, "skater")
        .await
        .unwrap();
    // Replay is absorbed.
    s.bounties
        .pay_out_claim("admin", &bounty_id, "skater")
        .await
        .unwrap();

    // 1000 reward: 100 fee, 180 filmer, 720 claimer.
    assert_eq!(
        require_user(s.store.as_ref(), "skater")
            .await
            .unwrap()
            .doc
            .wallet_balance,
        720
    );
    assert_eq!(
        require_user(s.store.as_ref(), "filmer")
            .await
            .unwrap()
            .doc
            .wallet_balance,
        180
    );

    let claim = get_doc::<Claim>(s.store.as_ref(), &paths::claim(&bounty_id, "skater"))
        .await
        .unwrap()
        .unwrap()
        .doc;
    assert_eq!(claim.status, ClaimStatus::Paid);
    let breakdown = claim.payout.unwrap();
    assert_eq!(
        breakdown.platform_fee + breakdown.claimer_amount + breakdown.filmer_amount,
        1000
    );

    // One Hold, one Fee, two Payouts even after the replay.
    let entries = ledger::entries_for_bounty(s.store.as_ref(), &bounty_id)
        .await
        .unwrap();
    let count = |t: LedgerTxType| entries.iter().filter(|e| e.tx_type == t).count();
    assert_eq!(count(LedgerTxType::Hold), 1);
    assert_eq!(count(LedgerTxType::Fee), 1);
    assert_eq!(count(LedgerTxType::Payout), 2);
}

#[tokio::test]
async fn rejected_clip_blocks_voting_until_resubmission() {
    // Probe measures 20s: past the cap, every clip rejected.
    let s = stack(20.0).await;
    seed_user(s.store.as_ref(), "creator", 0).await;
    seed_user(s.store.as_ref(), "opponent", 0).await;

    let id = s
        .challenges
        .create_challenge("creator", "opponent", clip("pending"))
        .await
        .unwrap()
        .challenge_id;
    s.challenges
        .accept_challenge("opponent", &id, clip("pending"))
        .await
        .unwrap();

    assert!(matches!(
        deliver_finalize(&s, &id, "creator").await,
        PipelineOutcome::Rejected(_)
    ));
    // Rejection never advances the challenge.
    assert_eq!(
        challenge_doc(s.store.as_ref(), &id).await.status,
        ChallengeStatus::OpponentUploading
    );

    // The owner may resubmit; the clip resets for a fresh upload.
    s.challenges
        .resubmit_clip("creator", &id, clip("pending"))
        .await
        .unwrap();
    let c = get_doc::<skate_settlement::model::Clip>(
        s.store.as_ref(),
        &paths::clip(&id, "creator"),
    )
    .await
    .unwrap()
    .unwrap()
    .doc;
    assert_eq!(c.status, skate_settlement::model::ClipStatus::PendingUpload);
}
