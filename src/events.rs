//! Document update fan-out
//!
//! Engines write documents; follow-up behavior that crosses engine
//! boundaries (a clip turning `Ready` opening a challenge's voting window)
//! hangs off a document-update hub instead of being hard-wired into the
//! pipeline. Observers are best-effort: a failing observer is logged and
//! never blocks the write that triggered it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::challenge::ChallengeEngine;
use crate::error::EngineResult;
use crate::model::ClipStatus;

/// Before/after view of one document write.
#[derive(Debug, Clone)]
pub struct DocUpdate {
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

#[async_trait]
pub trait DocObserver: Send + Sync {
    async fn on_update(&self, update: &DocUpdate) -> EngineResult<()>;
}

#[derive(Default)]
pub struct ObserverHub {
    observers: Vec<Arc<dyn DocObserver>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn DocObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub async fn notify(&self, update: DocUpdate) {
        for observer in &self.observers {
            if let Err(e) = observer.on_update(&update).await {
                warn!("observer failed for {}: {}", update.path, e);
            }
        }
    }
}

/// Opens a challenge's voting window when a clip transitions to `Ready`.
pub struct ClipStatusObserver {
    challenges: Arc<ChallengeEngine>,
}

impl ClipStatusObserver {
    pub fn new(challenges: Arc<ChallengeEngine>) -> Self {
        Self { challenges }
    }

    /// `challenges/{id}/clips/{userId}` → challenge id.
    fn challenge_of(path: &str) -> Option<&str> {
        let mut parts = path.split('/');
        if parts.next()? != "challenges" {
            return None;
        }
        let challenge_id = parts.next()?;
        if parts.next()? != "clips" {
            return None;
        }
        parts.next()?;
        if parts.next().is_some() || challenge_id == "drafts" {
            return None;
        }
        Some(challenge_id)
    }

    fn status_of(doc: Option<&Value>) -> Option<ClipStatus> {
        doc.and_then(|v| v.get("status"))
            .and_then(|s| serde_json::from_value(s.clone()).ok())
    }
}

#[async_trait]
impl DocObserver for ClipStatusObserver {
    async fn on_update(&self, update: &DocUpdate) -> EngineResult<()> {
        let challenge_id = match Self::challenge_of(&update.path) {
            Some(id) => id,
            None => return Ok(()),
        };

        let became_ready = Self::status_of(update.after.as_ref()) == Some(ClipStatus::Ready)
            && Self::status_of(update.before.as_ref()) != Some(ClipStatus::Ready);
        if !became_ready {
            return Ok(());
        }

        debug!("clip ready on challenge {}, checking both-ready", challenge_id);
        self.challenges.try_open_voting(challenge_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_challenge_path_parsing() {
        assert_eq!(
            ClipStatusObserver::challenge_of("challenges/ch1/clips/alice"),
            Some("ch1")
        );
        assert_eq!(ClipStatusObserver::challenge_of("challenges/ch1"), None);
        assert_eq!(
            ClipStatusObserver::challenge_of("challenges/drafts/clips/alice"),
            None
        );
        assert_eq!(ClipStatusObserver::challenge_of("bounties/b1/claims/c1"), None);
    }

    #[test]
    fn test_ready_transition_detection() {
        let before = json!({"status": "processing"});
        let after = json!({"status": "ready"});
        assert_eq!(
            ClipStatusObserver::status_of(Some(&before)),
            Some(ClipStatus::Processing)
        );
        assert_eq!(
            ClipStatusObserver::status_of(Some(&after)),
            Some(ClipStatus::Ready)
        );
        assert_eq!(ClipStatusObserver::status_of(None), None);
    }
}
