//! Video validation pipeline
//!
//! Consumes blob-finalize events for uploaded clips, re-measures the file
//! with ffprobe and settles the clip document to `Ready` or `Rejected` in
//! a single commit. Delivery is at-least-once, so every event first claims
//! an idempotency marker keyed by (path, generation, metageneration); a
//! replay that loses that race is reported as a duplicate and does no work.
//! The same commit moves a challenge clip to `Processing` so clients can
//! see validation is underway.
//!
//! Once the marker is claimed a terminal outcome always lands: validation
//! failures settle the clip as rejected with `ProcessingFailed`, and the
//! terminal commit retries contended revisions like every other engine
//! commit, so a clip racing a concurrent writer is not stranded in
//! `Processing`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::VideoConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{
    paths, AuditEntry, Clip, ClipStatus, ProcessedOutcome, ProcessedVideoRecord, RejectionReason,
    VideoMetadata,
};
use crate::notify::{Notification, NotificationDispatcher, NotificationKind};
use crate::store::{
    self, get_doc, DocumentStore, Precondition, StoreError, Write, MAX_TXN_ATTEMPTS,
};

const ALLOWED_CONTENT_TYPES: &[&str] = &["video/mp4", "video/quicktime", "video/webm"];

/// One blob-finalize delivery from the upload bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct FinalizeEvent {
    pub path: String,
    pub size: u64,
    pub content_type: String,
    pub generation: i64,
    pub metageneration: i64,
}

impl FinalizeEvent {
    /// Replay key: the same blob generation always maps to the same record.
    pub fn idempotency_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(
            format!("{}|{}|{}", self.path, self.generation, self.metageneration).as_bytes(),
        );
        hex::encode(hasher.finalize())
    }
}

/// Where an uploaded clip belongs, derived from its storage path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipRef {
    /// `challenges/{challenge_id}/{user_id}/{file}`
    Challenge {
        challenge_id: String,
        user_id: String,
    },
    /// `challenges/drafts/{user_id}/{file}`, validated but not bound to a
    /// challenge document.
    Draft { user_id: String },
}

impl ClipRef {
    pub fn parse(storage_path: &str) -> Option<Self> {
        let mut parts = storage_path.split('/');
        if parts.next()? != "challenges" {
            return None;
        }
        let second = parts.next()?;
        let third = parts.next()?;
        let file = parts.next()?;
        if file.is_empty() || parts.next().is_some() {
            return None;
        }
        if second == "drafts" {
            Some(ClipRef::Draft {
                user_id: third.to_string(),
            })
        } else {
            Some(ClipRef::Challenge {
                challenge_id: second.to_string(),
                user_id: third.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Event for a path outside the clip upload prefixes.
    Ignored,
    /// Replay of an already-processed delivery.
    Duplicate,
    Valid,
    Rejected(RejectionReason),
}

// ============================================================================
// PORTS
// ============================================================================

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the blob into a local scratch file.
    async fn download(&self, path: &str, dest: &Path) -> anyhow::Result<()>;
    async fn delete(&self, path: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait VideoProbe: Send + Sync {
    async fn probe(&self, file: &Path) -> anyhow::Result<VideoMetadata>;
}

/// Measures files by shelling out to `ffprobe`.
pub struct FfprobeProbe;

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_name: String,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: String,
}

#[async_trait]
impl VideoProbe for FfprobeProbe {
    async fn probe(&self, file: &Path) -> anyhow::Result<VideoMetadata> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=codec_name,width,height",
                "-show_entries",
                "format=duration",
                "-of",
                "json",
            ])
            .arg(file)
            .output()
            .await
            .context("failed to run ffprobe")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("ffprobe failed: {}", stderr.trim());
        }

        let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .context("failed to parse ffprobe output")?;
        let stream = parsed
            .streams
            .into_iter()
            .next()
            .context("no video stream in file")?;
        let duration_secs: f64 = parsed
            .format
            .duration
            .parse()
            .context("unparseable duration from ffprobe")?;

        Ok(VideoMetadata {
            duration_secs,
            width: stream.width,
            height: stream.height,
            codec: stream.codec_name,
        })
    }
}

/// Blob store backed by a local directory, used for single-node deploys
/// and demos; production wires a bucket-backed implementation here.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        if path.split('/').any(|part| part == "..") {
            bail!("blob path escapes the root: {}", path);
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn download(&self, path: &str, dest: &Path) -> anyhow::Result<()> {
        let src = self.resolve(path)?;
        tokio::fs::copy(&src, dest)
            .await
            .with_context(|| format!("failed to read blob {}", path))?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::remove_file(&target)
            .await
            .with_context(|| format!("failed to delete blob {}", path))?;
        Ok(())
    }
}

/// Scratch file removed on drop, whether or not processing succeeded.
struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    fn new() -> Self {
        Self {
            path: std::env::temp_dir().join(format!("clip-{}.bin", Uuid::new_v4())),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove scratch file {:?}: {}", self.path, e);
            }
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct VideoPipeline {
    store: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    probe: Arc<dyn VideoProbe>,
    notifier: Arc<NotificationDispatcher>,
    video: VideoConfig,
}

impl VideoPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        probe: Arc<dyn VideoProbe>,
        notifier: Arc<NotificationDispatcher>,
        video: VideoConfig,
    ) -> Self {
        Self {
            store,
            blobs,
            probe,
            notifier,
            video,
        }
    }

    pub async fn handle_finalize(&self, event: &FinalizeEvent) -> EngineResult<PipelineOutcome> {
        if !event.path.starts_with("challenges/") {
            debug!("ignoring finalize event outside clip prefixes: {}", event.path);
            return Ok(PipelineOutcome::Ignored);
        }
        // Unparseable paths under the clip prefix are still recorded, as a
        // rejection, so replays of the same bad delivery stay idempotent.
        let clip_ref = ClipRef::parse(&event.path);

        let key = event.idempotency_key();
        let record_path = paths::processed_video(&key);

        if !self.claim_marker(clip_ref.as_ref(), &record_path, &key, event).await? {
            debug!("duplicate finalize delivery for {}", event.path);
            return Ok(PipelineOutcome::Duplicate);
        }

        let verdict = if clip_ref.is_none() {
            Err(RejectionReason::InvalidFormat)
        } else {
            match self.validate(event).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("pipeline failure for {}: {}", event.path, e);
                    Err(RejectionReason::ProcessingFailed)
                }
            }
        };

        match verdict {
            Ok(metadata) => {
                self.settle(clip_ref.as_ref(), &record_path, &key, event, Ok(&metadata))
                    .await?;
                info!(
                    "clip {} valid: {:.2}s {}x{} {}",
                    event.path,
                    metadata.duration_secs,
                    metadata.width,
                    metadata.height,
                    metadata.codec
                );
                Ok(PipelineOutcome::Valid)
            }
            Err(reason) => {
                self.settle(clip_ref.as_ref(), &record_path, &key, event, Err(reason))
                    .await?;
                if let Err(e) = self.blobs.delete(&event.path).await {
                    warn!("failed to delete rejected blob {}: {}", event.path, e);
                }
                info!("clip {} rejected: {:?}", event.path, reason);
                Ok(PipelineOutcome::Rejected(reason))
            }
        }
    }

    /// Claims the idempotency marker for this delivery and, for challenge
    /// clips, moves the clip document to `Processing` in the same commit.
    /// Returns false when another delivery already claimed the marker.
    async fn claim_marker(
        &self,
        clip_ref: Option<&ClipRef>,
        record_path: &str,
        key: &str,
        event: &FinalizeEvent,
    ) -> EngineResult<bool> {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let marker = ProcessedVideoRecord {
                key: key.to_string(),
                storage_path: event.path.clone(),
                generation: event.generation,
                metageneration: event.metageneration,
                outcome: ProcessedOutcome::Processing,
                rejection_reason: None,
                processed_at: Utc::now(),
            };
            let mut writes = vec![Write::put(record_path, Precondition::NotExists, &marker)?];

            if let Some(ClipRef::Challenge {
                challenge_id,
                user_id,
            }) = clip_ref
            {
                let clip_path = paths::clip(challenge_id, user_id);
                if let Some(clip_snap) = get_doc::<Clip>(self.store.as_ref(), &clip_path).await? {
                    let mut clip = clip_snap.doc;
                    clip.status = ClipStatus::Processing;
                    clip.updated_at = Utc::now();
                    writes.push(Write::put(
                        &clip_path,
                        Precondition::Revision(clip_snap.revision),
                        &clip,
                    )?);
                }
            }

            match self.store.commit(writes).await {
                Ok(()) => return Ok(true),
                Err(StoreError::Conflict(path)) if path == record_path => return Ok(false),
                Err(StoreError::Conflict(_)) if attempt < MAX_TXN_ATTEMPTS => {
                    store::backoff(attempt).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal("finalize marker contention".into()))
    }

    /// Gates in cost order; the size check runs before any download.
    async fn validate(
        &self,
        event: &FinalizeEvent,
    ) -> anyhow::Result<Result<VideoMetadata, RejectionReason>> {
        if event.size > self.video.max_file_size_bytes {
            return Ok(Err(RejectionReason::FileTooLarge));
        }
        if !ALLOWED_CONTENT_TYPES.contains(&event.content_type.as_str()) {
            return Ok(Err(RejectionReason::InvalidFormat));
        }

        let scratch = ScratchFile::new();
        self.blobs.download(&event.path, &scratch.path).await?;

        let metadata = match self.probe.probe(&scratch.path).await {
            Ok(m) => m,
            Err(e) => {
                warn!("probe failed for {}: {}", event.path, e);
                return Ok(Err(RejectionReason::FileCorrupted));
            }
        };

        let tolerance = self.video.duration_tolerance_secs;
        if metadata.duration_secs < self.video.min_duration_secs - tolerance {
            return Ok(Err(RejectionReason::DurationTooShort));
        }
        if metadata.duration_secs > self.video.max_duration_secs + tolerance {
            return Ok(Err(RejectionReason::DurationTooLong));
        }

        Ok(Ok(metadata))
    }

    /// Terminal commit: the idempotency record outcome, the clip document
    /// (for challenge clips) and an audit entry land together. Retried on
    /// contended revisions so a clip raced by a concurrent writer still
    /// leaves `Processing`.
    async fn settle(
        &self,
        clip_ref: Option<&ClipRef>,
        record_path: &str,
        key: &str,
        event: &FinalizeEvent,
        verdict: Result<&VideoMetadata, RejectionReason>,
    ) -> EngineResult<()> {
        for attempt in 1..=MAX_TXN_ATTEMPTS {
            let record_snap = get_doc::<ProcessedVideoRecord>(self.store.as_ref(), record_path)
                .await?
                .ok_or_else(|| EngineError::Internal("idempotency record vanished".into()))?;

            let mut record = record_snap.doc;
            record.processed_at = Utc::now();
            match verdict {
                Ok(_) => record.outcome = ProcessedOutcome::Valid,
                Err(reason) => {
                    record.outcome = ProcessedOutcome::Rejected;
                    record.rejection_reason = Some(reason);
                }
            }

            let mut writes = vec![Write::put(
                record_path,
                Precondition::Revision(record_snap.revision),
                &record,
            )?];

            let mut rejected_owner = None;
            if let Some(ClipRef::Challenge {
                challenge_id,
                user_id,
            }) = clip_ref
            {
                let clip_path = paths::clip(challenge_id, user_id);
                match get_doc::<Clip>(self.store.as_ref(), &clip_path).await? {
                    Some(clip_snap) => {
                        let mut clip = clip_snap.doc;
                        match verdict {
                            Ok(metadata) => {
                                clip.status = ClipStatus::Ready;
                                clip.metadata = Some(metadata.clone());
                                clip.rejection_reason = None;
                            }
                            Err(reason) => {
                                clip.status = ClipStatus::Rejected;
                                clip.rejection_reason = Some(reason);
                                rejected_owner = Some(clip.owner_id.clone());
                            }
                        }
                        clip.updated_at = Utc::now();
                        writes.push(Write::put(
                            &clip_path,
                            Precondition::Revision(clip_snap.revision),
                            &clip,
                        )?);
                    }
                    None => {
                        warn!(
                            "finalize event for {} has no clip document at {}",
                            event.path, clip_path
                        );
                    }
                }
            }

            let audit = AuditEntry::new(
                "pipeline",
                "process_video",
                &event.path,
                format!("key={} outcome={:?}", key, record.outcome),
            );
            writes.push(Write::put(
                paths::audit(&audit.id),
                Precondition::NotExists,
                &audit,
            )?);

            match self.store.commit(writes).await {
                Ok(()) => {
                    if let Some(owner) = rejected_owner {
                        self.notifier
                            .dispatch(vec![Notification::new(
                                &owner,
                                NotificationKind::ClipRejected,
                                event.path.clone(),
                                "your clip failed validation, upload a new one",
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

        Err(EngineError::Internal("clip settle contention".into()))
    }

    /// Scheduled sweep: drop idempotency records past the retention window.
    pub async fn sweep_processed_records(&self) -> EngineResult<usize> {
        let cutoff = Utc::now() - Duration::days(self.video.processed_retention_days);
        let raw = self
            .store
            .list_raw("processed_videos/")
            .await
            .map_err(EngineError::from)?;

        let mut removed = 0;
        for (path, value, revision) in raw {
            let record: ProcessedVideoRecord = match serde_json::from_value(value) {
                Ok(r) => r,
                Err(e) => {
                    warn!("skipping malformed processed record {}: {}", path, e);
                    continue;
                }
            };
            if record.processed_at >= cutoff {
                continue;
            }
            let write = Write::delete(&path, Precondition::Revision(revision));
            match self.store.commit(vec![write]).await {
                Ok(()) => removed += 1,
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed > 0 {
            info!("swept {} processed video records", removed);
        }
        Ok(removed)
    }
}
