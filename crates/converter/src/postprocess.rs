//! Final touches on the encoded artifact.
//!
//! Standard stickers longer than the baseline get their container duration
//! rewritten to a large sentinel so clients keep looping them. Emoji stickers
//! have a hard length cap and are stream-copied down to it instead.

use std::path::{Path, PathBuf};
use std::time::Duration;
use log::{debug, info, warn};
use crate::encode::{EncodeResult, FFmpegRunner};
use crate::error::{ConvertError, ConvertResult};
use crate::ffprobe::{FFProbeData, Prober};
use crate::policy::BASELINE_SECS;
use crate::temp::TempArtifacts;

/// Matroska `Duration` element id
pub const DURATION_MARKER: [u8; 2] = [0x44, 0x89];
/// Value written after the marker, little-endian
pub const LOOPING_DURATION: u32 = 1_000_000;
/// Emoji stickers are cut to this length
pub const EMOJI_TRIM_SECS: f64 = 2.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// Offset of the marker that was patched
    Patched { offset: usize },
    MarkerNotFound,
}

/// Overwrite the 4 bytes following the first duration marker with the sentinel
pub fn patch_duration(bytes: &mut [u8]) -> PatchOutcome {
    let field = DURATION_MARKER.len() + 4;
    let found = bytes
        .windows(field)
        .position(|w| w[..DURATION_MARKER.len()] == DURATION_MARKER);

    match found {
        Some(offset) => {
            let start = offset + DURATION_MARKER.len();
            bytes[start..start + 4].copy_from_slice(&LOOPING_DURATION.to_le_bytes());
            PatchOutcome::Patched { offset }
        }
        None => PatchOutcome::MarkerNotFound,
    }
}

/// What happens to an encoded artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    Unchanged,
    PatchDuration,
    Trim,
}

impl PostAction {
    /// Standard stickers look at the encoded duration only. Emoji are already
    /// capped at encode time, so an over-length source also forces the trim
    /// unless the encode already came out at or under the trim length.
    pub fn decide(is_emoji: bool, source_duration: Option<f64>, encoded_duration: Option<f64>) -> Self {
        let over = |d: Option<f64>| matches!(d, Some(d) if d > BASELINE_SECS);
        if is_emoji {
            let longer_than_trim = encoded_duration.map_or(true, |d| d > EMOJI_TRIM_SECS);
            if over(encoded_duration) || (over(source_duration) && longer_than_trim) {
                return PostAction::Trim;
            }
        } else if over(encoded_duration) {
            return PostAction::PatchDuration;
        }
        PostAction::Unchanged
    }
}

/// The artifact handed back to the caller
#[derive(Debug, Clone)]
pub struct FinalArtifact {
    pub path: PathBuf,
    pub metadata: FFProbeData,
    pub action: PostAction,
}

pub struct PostProcessor<'a> {
    runner: &'a FFmpegRunner,
    prober: &'a Prober,
}

impl<'a> PostProcessor<'a> {
    pub fn new(runner: &'a FFmpegRunner, prober: &'a Prober) -> Self {
        Self { runner, prober }
    }

    pub async fn run(
        &self,
        job_id: &str,
        is_emoji: bool,
        source_duration: Option<f64>,
        encoded: EncodeResult,
        temps: &mut TempArtifacts,
        deadline: Duration,
    ) -> ConvertResult<FinalArtifact> {
        let action = PostAction::decide(is_emoji, source_duration, encoded.media.duration);
        debug!("Job {}: post-process action {:?}", job_id, action);

        match action {
            PostAction::Unchanged => Ok(FinalArtifact {
                path: encoded.artifact_path,
                metadata: encoded.metadata,
                action,
            }),
            PostAction::PatchDuration => {
                let patched = temps.allocate("webm");
                self.patch_copy(job_id, &encoded.artifact_path, &patched).await?;
                Ok(FinalArtifact {
                    path: patched,
                    metadata: encoded.metadata,
                    action,
                })
            }
            PostAction::Trim => {
                let trimmed = temps.allocate("webm");
                self.runner
                    .trim(job_id, &encoded.artifact_path, &trimmed, EMOJI_TRIM_SECS, deadline)
                    .await?;
                let metadata = self
                    .prober
                    .probe(&trimmed.to_string_lossy())
                    .await
                    .map_err(|e| ConvertError::PostProcessFailed(format!("trimmed artifact unreadable: {}", e)))?;
                info!("Job {}: ✂️  Trimmed emoji to {}s", job_id, EMOJI_TRIM_SECS);
                Ok(FinalArtifact {
                    path: trimmed,
                    metadata,
                    action,
                })
            }
        }
    }

    async fn patch_copy(&self, job_id: &str, source: &Path, target: &Path) -> ConvertResult<()> {
        let mut bytes = tokio::fs::read(source)
            .await
            .map_err(|e| ConvertError::PostProcessFailed(format!("cannot read {}: {}", source.display(), e)))?;

        match patch_duration(&mut bytes) {
            PatchOutcome::Patched { offset } => {
                debug!("Job {}: duration field patched at offset {}", job_id, offset);
            }
            PatchOutcome::MarkerNotFound => {
                warn!("Job {}: duration marker not found, keeping artifact unpatched", job_id);
            }
        }

        tokio::fs::write(target, &bytes)
            .await
            .map_err(|e| ConvertError::PostProcessFailed(format!("cannot write {}: {}", target.display(), e)))
    }
}
