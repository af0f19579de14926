use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Requested sticker silhouette
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameShape {
    #[default]
    Square,
    Circle,
    Rounded,
    Medium,
    Lite,
}

impl FrameShape {
    /// Anything other than a plain square needs a mask
    pub fn is_shaped(&self) -> bool {
        !matches!(self, FrameShape::Square)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameShape::Square => "square",
            FrameShape::Circle => "circle",
            FrameShape::Rounded => "rounded",
            FrameShape::Medium => "medium",
            FrameShape::Lite => "lite",
        }
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "square" | "" => Ok(FrameShape::Square),
            "circle" => Ok(FrameShape::Circle),
            "rounded" => Ok(FrameShape::Rounded),
            "medium" => Ok(FrameShape::Medium),
            "lite" => Ok(FrameShape::Lite),
            other => Err(format!("unknown frame shape: {}", other)),
        }
    }
}

/// Where the source media comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobInput {
    /// Base64 payload, optionally as a `data:` URI
    Inline { data: String },
    /// http(s) URL
    Url { url: String },
    /// File on the worker's filesystem
    Path { path: PathBuf },
}

impl JobInput {
    /// Short description for logs (never the inline payload itself)
    pub fn describe(&self) -> String {
        match self {
            JobInput::Inline { data } => format!("inline payload ({} chars)", data.len()),
            JobInput::Url { url } => url.clone(),
            JobInput::Path { path } => path.display().to_string(),
        }
    }
}

/// A single conversion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub enqueued_at: DateTime<Utc>,
    pub input: JobInput,
    #[serde(default)]
    pub frame_shape: FrameShape,
    #[serde(default)]
    pub force_crop: bool,
    #[serde(default)]
    pub is_emoji: bool,
    /// Bitrate in kbps for short clips
    #[serde(default)]
    pub bitrate: Option<u32>,
    /// Duration ceiling in seconds
    #[serde(default)]
    pub max_duration: Option<u32>,
    /// Opaque caller value echoed back in the result
    #[serde(default)]
    pub tag: Option<String>,
}

impl Job {
    /// Create a new job for the given input, enqueued now
    pub fn new(input: JobInput) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            enqueued_at: Utc::now(),
            input,
            frame_shape: FrameShape::default(),
            force_crop: false,
            is_emoji: false,
            bitrate: None,
            max_duration: None,
            tag: None,
        }
    }

    pub fn with_shape(mut self, shape: FrameShape) -> Self {
        self.frame_shape = shape;
        self
    }

    pub fn with_emoji(mut self, is_emoji: bool) -> Self {
        self.is_emoji = is_emoji;
        self
    }

    pub fn with_force_crop(mut self, force_crop: bool) -> Self {
        self.force_crop = force_crop;
        self
    }

    /// Time since enqueue
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.enqueued_at
    }
}
