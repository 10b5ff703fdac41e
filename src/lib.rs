//! Skate Settlement - challenge and bounty settlement for a skate platform
//!
//! Settles the money- and state-bearing flows of the platform: two-party
//! video battles ("challenges"), community-verified spot bounties, the
//! idempotent clip validation pipeline, and the internal ledger behind
//! payouts and refunds.
//!
//! # How it works
//!
//! 1. A skater challenges another with a clip; the opponent answers with
//!    their own. When both clips pass validation, a 48h voting window opens.
//! 2. Spot owners post bounties with a held reward; skaters claim with a clip
//!    and the community (or the creator) verifies. An approved claim locks
//!    the bounty and pays out through the ledger.
//! 3. Every upload runs through the validation pipeline exactly once per blob
//!    generation; replays of the same delivery are absorbed.
//!
//! # Anti-abuse measures
//!
//! - One claim per claimer and one vote per voter, enforced by document ids
//!    with not-exists write preconditions
//! - A locked bounty can never approve a second claim
//! - Per-action rate limits and a reputation gate on voting
//! - All money math in integer minor units; the ledger is append-only

pub mod auth;
pub mod bounty;
pub mod challenge;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod ratelimit;
pub mod reputation;
pub mod server;
pub mod store;
pub mod video;

pub use bounty::BountyEngine;
pub use challenge::ChallengeEngine;
pub use config::Config;
pub use error::{EngineError, EngineResult};
pub use ratelimit::RateLimiter;
pub use store::{DocumentStore, MemoryStore, SqliteStore};
pub use video::VideoPipeline;
