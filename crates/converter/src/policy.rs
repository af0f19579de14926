//! Duration and bitrate selection for the sticker size budget.
//!
//! The messaging platform caps the artifact size, so once a clip runs past
//! [`BASELINE_SECS`] the bitrate is derived from a fixed byte budget spread
//! over the clip. Shorter clips keep the caller's bitrate.

use serde::Serialize;

/// Clips at or below this length keep the requested bitrate
pub const BASELINE_SECS: f64 = 3.0;
/// Emoji stickers never run longer than this
pub const EMOJI_MAX_SECS: f64 = 3.0;
/// Byte budget for standard stickers
pub const STANDARD_BUDGET_BYTES: f64 = 17.0 * 8192.0;
/// Byte budget for emoji stickers
pub const EMOJI_BUDGET_BYTES: f64 = 5.0 * 8192.0;
/// Peak rate relative to the target bitrate
pub const MAXRATE_FACTOR: f64 = 1.5;
/// Rate-control buffer, kbps
pub const BUFSIZE_KBPS: u32 = 2000;

/// Output canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const STANDARD: Dimensions = Dimensions { width: 512, height: 512 };
    pub const EMOJI: Dimensions = Dimensions { width: 100, height: 100 };

    pub fn for_variant(is_emoji: bool) -> Self {
        if is_emoji {
            Self::EMOJI
        } else {
            Self::STANDARD
        }
    }
}

/// Result of the policy for one job
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EncodeBudget {
    pub duration_secs: f64,
    pub bitrate_kbps: f64,
    pub maxrate_kbps: f64,
    pub bufsize_kbps: u32,
    pub dimensions: Dimensions,
}

/// Clip length actually encoded
pub fn effective_duration(probed: Option<f64>, max_duration: f64, is_emoji: bool) -> f64 {
    let mut duration = max_duration.min(probed.unwrap_or(max_duration));
    if is_emoji {
        duration = duration.min(EMOJI_MAX_SECS);
    }
    duration
}

/// Target bitrate in kbps for a clip of the given effective length
pub fn target_bitrate(duration_secs: f64, is_emoji: bool, bitrate_hint: u32) -> f64 {
    if duration_secs > BASELINE_SECS {
        let budget = if is_emoji {
            EMOJI_BUDGET_BYTES
        } else {
            STANDARD_BUDGET_BYTES
        };
        (budget / duration_secs) / 100.0
    } else {
        f64::from(bitrate_hint)
    }
}

/// Full policy: duration, rates and canvas
pub fn encode_budget(
    probed_duration: Option<f64>,
    max_duration: f64,
    is_emoji: bool,
    bitrate_hint: u32,
) -> EncodeBudget {
    let duration_secs = effective_duration(probed_duration, max_duration, is_emoji);
    let bitrate_kbps = target_bitrate(duration_secs, is_emoji, bitrate_hint);

    EncodeBudget {
        duration_secs,
        bitrate_kbps,
        maxrate_kbps: bitrate_kbps * MAXRATE_FACTOR,
        bufsize_kbps: BUFSIZE_KBPS,
        dimensions: Dimensions::for_variant(is_emoji),
    }
}
