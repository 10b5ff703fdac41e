//! Core data model
//!
//! Every entity here is persisted as one document in the shared store.
//! Status transitions are monotonic; the engines enforce the transitions,
//! the documents just record them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// CHALLENGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    CreatorReady,
    OpponentUploading,
    BothReady,
    Voting,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub creator_id: String,
    pub opponent_id: String,
    pub status: ChallengeStatus,
    /// voter id -> participant id voted for
    #[serde(default)]
    pub votes: std::collections::BTreeMap<String, String>,
    pub creator_votes: u32,
    pub opponent_votes: u32,
    /// Acceptance deadline for the opponent.
    pub deadline: DateTime<Utc>,
    /// Set when the voting window opens.
    pub voting_ends_at: Option<DateTime<Utc>>,
    /// None until completed; None after completion means a draw.
    pub winner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Challenge {
    pub fn participants(&self) -> [&str; 2] {
        [self.creator_id.as_str(), self.opponent_id.as_str()]
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.creator_id == user_id || self.opponent_id == user_id
    }
}

// ============================================================================
// CLIP
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    PendingUpload,
    Processing,
    Ready,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    DurationTooLong,
    DurationTooShort,
    FileTooLarge,
    InvalidFormat,
    FileCorrupted,
    ProcessingFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration_secs: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub owner_id: String,
    pub storage_path: String,
    /// Duration declared by the client at submission; the pipeline
    /// re-measures and the measured value wins.
    pub declared_duration_secs: f64,
    pub status: ClipStatus,
    pub rejection_reason: Option<RejectionReason>,
    pub metadata: Option<VideoMetadata>,
    pub thumbnail_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// VIDEO PIPELINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedOutcome {
    Processing,
    Valid,
    Rejected,
}

/// Idempotency record for one blob-finalize delivery. Written at pipeline
/// entry, finalized with the outcome, never deleted by the pipeline itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedVideoRecord {
    pub key: String,
    pub storage_path: String,
    pub generation: i64,
    pub metageneration: i64,
    pub outcome: ProcessedOutcome,
    pub rejection_reason: Option<RejectionReason>,
    pub processed_at: DateTime<Utc>,
}

// ============================================================================
// BOUNTY / CLAIM / VOTE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BountyStatus {
    Open,
    Locked,
    Expired,
    Cancelled,
    Verified,
    Paid,
}

/// Quorum rules for community verification of a claim.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VerificationPolicy {
    pub min_votes: u32,
    /// Required approvals as basis points of total votes (6000 = 60%).
    pub approve_ratio_bps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bounty {
    pub id: String,
    pub spot_id: String,
    pub creator_id: String,
    pub trick_description: String,
    /// Reward in integer minor units of `currency`.
    pub reward: u64,
    pub currency: String,
    pub platform_fee_bps: u32,
    pub filmer_cut_bps: u32,
    pub status: BountyStatus,
    pub policy: VerificationPolicy,
    pub expires_at: DateTime<Utc>,
    /// Set when the bounty is locked by a first approval.
    pub lock_reason: Option<String>,
    pub claim_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimStatus {
    Pending,
    Approved,
    Rejected,
    Withdrawn,
    Paid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilmerTag {
    pub filmer_id: String,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutBreakdown {
    pub platform_fee: u64,
    pub claimer_amount: u64,
    pub filmer_amount: u64,
}

/// A claim document id is the claimer id, which makes "one claim per
/// (bounty, claimer)" a not-exists precondition instead of a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub claimer_id: String,
    pub clip_storage_path: String,
    pub declared_duration_secs: f64,
    pub filmer: Option<FilmerTag>,
    pub status: ClaimStatus,
    pub approve_votes: u32,
    pub reject_votes: u32,
    pub payout: Option<PayoutBreakdown>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Claim {
    pub fn total_votes(&self) -> u32 {
        self.approve_votes + self.reject_votes
    }
}

/// One vote per (claim, voter); the document id is the voter id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub voter_id: String,
    pub approve: bool,
    /// Always 1 in v1; reserved for weighted voting.
    pub weight: u32,
    pub comment: Option<String>,
    pub cast_at: DateTime<Utc>,
}

// ============================================================================
// LEDGER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerTxType {
    Hold,
    Refund,
    Payout,
    Fee,
}

/// Append-only funds movement. Never mutated, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTx {
    pub id: String,
    pub tx_type: LedgerTxType,
    pub amount: u64,
    pub currency: String,
    pub from_user: Option<String>,
    pub to_user: Option<String>,
    pub bounty_id: Option<String>,
    pub claim_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// USERS / RATE LIMITS / AUDIT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    /// Wallet balance in integer minor units.
    pub wallet_balance: u64,
    pub reputation: i32,
    pub banned: bool,
    #[serde(default)]
    pub roles: Vec<Role>,
    #[serde(default)]
    pub device_tokens: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn new(id: impl Into<String>, baseline_reputation: i32) -> Self {
        Self {
            id: id.into(),
            wallet_balance: 0,
            reputation: baseline_reputation,
            banned: false,
            roles: vec![Role::User],
            device_tokens: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitCounter {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub last_touched: DateTime<Utc>,
}

/// Written in the same commit as the state change it records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub actor: String,
    pub action: String,
    pub subject: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(actor: &str, action: &str, subject: &str, detail: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            subject: subject.to_string(),
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

// ============================================================================
// DOCUMENT PATHS
// ============================================================================

/// Logical store layout. Everything below is rooted at these helpers so no
/// engine ever formats a path by hand.
pub mod paths {
    pub fn user(id: &str) -> String {
        format!("users/{}", id)
    }

    pub fn challenge(id: &str) -> String {
        format!("challenges/{}", id)
    }

    pub fn clip(challenge_id: &str, user_id: &str) -> String {
        format!("challenges/{}/clips/{}", challenge_id, user_id)
    }

    pub fn bounty(id: &str) -> String {
        format!("bounties/{}", id)
    }

    pub fn claim(bounty_id: &str, claim_id: &str) -> String {
        format!("bounties/{}/claims/{}", bounty_id, claim_id)
    }

    pub fn vote(bounty_id: &str, claim_id: &str, voter_id: &str) -> String {
        format!("bounties/{}/claims/{}/votes/{}", bounty_id, claim_id, voter_id)
    }

    pub fn ledger_tx(id: &str) -> String {
        format!("ledger/{}", id)
    }

    pub fn rate_limit(actor: &str, action: &str) -> String {
        format!("rate_limits/{}/{}", actor, action)
    }

    pub fn processed_video(key: &str) -> String {
        format!("processed_videos/{}", key)
    }

    pub fn audit(id: &str) -> String {
        format!("audit/{}", id)
    }
}
