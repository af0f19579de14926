use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use crate::error::{ConvertError, ConvertResult};

/// Default upper bound for a single ffprobe run
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Codecs that carry their own transparency
const ALPHA_NATIVE_CODECS: &[&str] = &["gif", "webp", "png"];

/// Complete ffprobe output structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FFProbeData {
    #[serde(default)]
    pub streams: Vec<FFProbeStream>,
    #[serde(default)]
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FFProbeFormat {
    #[serde(default)]
    pub format_name: Option<String>,
    /// Seconds as a decimal string, or "N/A"
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<String>,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
}

/// Stream-level metadata from ffprobe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FFProbeStream {
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub codec_type: Option<String>,
    #[serde(default)]
    pub codec_name: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub pix_fmt: Option<String>,
    #[serde(default)]
    pub r_frame_rate: Option<String>,
    #[serde(default)]
    pub avg_frame_rate: Option<String>,
    #[serde(default)]
    pub tags: Option<HashMap<String, String>>,
}

impl FFProbeData {
    /// First stream whose codec_type is video
    pub fn first_video_stream(&self) -> Option<&FFProbeStream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
    }

    /// Container duration; None when absent or not numeric
    pub fn duration_secs(&self) -> Option<f64> {
        self.format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d >= 0.0)
    }

    /// Reduce the raw document to what the pipeline branches on
    pub fn to_probed_media(&self, input: &str) -> ConvertResult<ProbedMedia> {
        let stream = self.first_video_stream().ok_or_else(|| ConvertError::NoVideoStream {
            input: input.to_string(),
        })?;

        let alpha = stream
            .tags
            .as_ref()
            .and_then(|t| t.get("alpha_mode"))
            .map(|v| v == "1")
            .unwrap_or(false);

        Ok(ProbedMedia {
            duration: self.duration_secs(),
            video: VideoStream {
                codec_name: stream
                    .codec_name
                    .clone()
                    .unwrap_or_default()
                    .to_lowercase(),
                width: stream.width.unwrap_or(0),
                height: stream.height.unwrap_or(0),
                pixel_format: stream.pix_fmt.clone(),
                alpha,
                frame_rate: stream.r_frame_rate.clone(),
            },
        })
    }
}

/// The selected video stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoStream {
    pub codec_name: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: Option<String>,
    /// Set when the stream is tagged `alpha_mode=1`
    pub alpha: bool,
    /// Raw rational, e.g. "30000/1001"
    pub frame_rate: Option<String>,
}

impl VideoStream {
    /// Palette/alpha formats, or any stream tagged with alpha
    pub fn is_alpha_native(&self) -> bool {
        self.alpha || ALPHA_NATIVE_CODECS.contains(&self.codec_name.as_str())
    }

    /// Frame rate as a number; None for zero, undefined or garbage ratios
    pub fn fps(&self) -> Option<f64> {
        self.frame_rate.as_deref().and_then(parse_frame_rate)
    }
}

/// Probe result the pipeline works with
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbedMedia {
    /// None when the container reports no usable duration
    pub duration: Option<f64>,
    pub video: VideoStream,
}

/// Parse a frame rate string (e.g., "30/1", "29.97", "0/0")
pub fn parse_frame_rate(frame_rate_str: &str) -> Option<f64> {
    if let Some((num_str, den_str)) = frame_rate_str.split_once('/') {
        let num = num_str.trim().parse::<f64>().ok()?;
        let den = den_str.trim().parse::<f64>().ok()?;
        if den != 0.0 && num > 0.0 {
            return Some(num / den);
        }
        return None;
    }

    frame_rate_str
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f > 0.0)
}

/// Runs ffprobe against files or URLs
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe_bin: PathBuf,
    timeout: Duration,
}

impl Prober {
    pub fn new(ffprobe_bin: PathBuf) -> Self {
        Self {
            ffprobe_bin,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Bound each ffprobe run; the child is killed on expiry
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run ffprobe and parse the JSON output
    pub async fn probe(&self, media_ref: &str) -> ConvertResult<FFProbeData> {
        debug!("Executing ffprobe for: {}", media_ref);

        let mut command = Command::new(&self.ffprobe_bin);
        command
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_streams")
            .arg("-show_format")
            .arg(media_ref)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                warn!("⏰ ffprobe timed out after {}s on {}", self.timeout.as_secs(), media_ref);
                ConvertError::ProbeFailed {
                    input: media_ref.to_string(),
                    message: format!("ffprobe timed out after {}s", self.timeout.as_secs()),
                }
            })?
            .map_err(|e| ConvertError::ProbeFailed {
                input: media_ref.to_string(),
                message: format!(
                    "failed to execute {}: {}",
                    self.ffprobe_bin.display(),
                    e
                ),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(ConvertError::ProbeFailed {
                input: media_ref.to_string(),
                message: format!("exit code {}: {}", exit_code, stderr.trim()),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|e| ConvertError::ProbeFailed {
            input: media_ref.to_string(),
            message: format!("unparseable ffprobe JSON: {}", e),
        })
    }

    /// Probe and select the video stream
    pub async fn probe_media(&self, media_ref: &str) -> ConvertResult<(FFProbeData, ProbedMedia)> {
        let data = self.probe(media_ref).await?;
        let media = data.to_probed_media(media_ref)?;
        Ok((data, media))
    }
}
