use std::path::{Path, PathBuf};
use log::debug;
use serde::Serialize;
use crate::config::ConverterConfig;
use crate::error::{ConvertError, ConvertResult};
use crate::ffprobe::{ProbedMedia, VideoStream};
use crate::filter_graph::{build_sticker_graph, Presentation, StickerGraph, Treatment};
use crate::job::Job;
use crate::policy::{encode_budget, Dimensions};

/// Output frame rate ceiling
pub const MAX_FRAME_RATE: f64 = 30.0;

/// Everything the encode step needs, computed once per job
#[derive(Debug, Clone, Serialize)]
pub struct EncodePlan {
    pub duration_secs: f64,
    pub bitrate_kbps: f64,
    pub maxrate_kbps: f64,
    pub bufsize_kbps: u32,
    pub dimensions: Dimensions,
    pub frame_rate: f64,
    /// Placed before `-i <source>`
    pub input_options: Vec<String>,
    /// Template fed as the second input when the graph shapes the sticker
    pub mask_input: Option<PathBuf>,
    #[serde(skip)]
    pub graph: StickerGraph,
    pub output_options: Vec<String>,
}

impl EncodePlan {
    pub fn build(job: &Job, media: &ProbedMedia, cfg: &ConverterConfig) -> ConvertResult<Self> {
        let max_duration = job.max_duration.unwrap_or(cfg.default_max_duration);
        let bitrate_hint = job.bitrate.unwrap_or(cfg.default_bitrate);
        let budget = encode_budget(media.duration, f64::from(max_duration), job.is_emoji, bitrate_hint);

        let presentation = Presentation {
            shape: job.frame_shape,
            force_crop: job.force_crop,
            is_emoji: job.is_emoji,
        };
        let graph = build_sticker_graph(&media.video, &presentation)?;

        let mask_input = match graph.mask_template() {
            Some(template) => {
                let path = cfg.assets_dir.join(template.file_name());
                if !path.is_file() {
                    return Err(ConvertError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("mask template missing: {}", path.display()),
                    )));
                }
                Some(path)
            }
            None => None,
        };

        let mut input_options = Vec::new();
        if media.video.alpha {
            // The native vp9 decoder drops the alpha plane
            input_options.extend(["-c:v".to_string(), "libvpx-vp9".to_string()]);
        }
        input_options.extend(["-t".to_string(), format_secs(budget.duration_secs)]);

        let frame_rate = output_frame_rate(&media.video);
        let output_options = vec![
            "-an".to_string(),
            "-c:v".to_string(),
            "libvpx-vp9".to_string(),
            "-pix_fmt".to_string(),
            "yuva420p".to_string(),
            "-metadata".to_string(),
            format!("title={}", cfg.output_title),
            "-b:v".to_string(),
            format_kbps(budget.bitrate_kbps),
            "-maxrate".to_string(),
            format_kbps(budget.maxrate_kbps),
            "-bufsize".to_string(),
            format!("{}k", budget.bufsize_kbps),
            "-r".to_string(),
            format_rate(frame_rate),
            "-t".to_string(),
            format_secs(budget.duration_secs),
        ];

        let plan = Self {
            duration_secs: budget.duration_secs,
            bitrate_kbps: budget.bitrate_kbps,
            maxrate_kbps: budget.maxrate_kbps,
            bufsize_kbps: budget.bufsize_kbps,
            dimensions: budget.dimensions,
            frame_rate,
            input_options,
            mask_input,
            graph,
            output_options,
        };
        debug!("Encode plan for job {}: {:?}", job.id, plan.treatment());
        Ok(plan)
    }

    pub fn treatment(&self) -> Treatment {
        self.graph.treatment
    }

    /// Full ffmpeg argument vector writing to `output`
    pub fn ffmpeg_args(&self, media_ref: &str, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-v", "error", "-nostats", "-progress", "pipe:1"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        args.extend(self.input_options.iter().cloned());
        args.push("-i".to_string());
        args.push(media_ref.to_string());

        if let Some(mask) = &self.mask_input {
            args.push("-i".to_string());
            args.push(mask.to_string_lossy().into_owned());
        }

        args.push("-filter_complex".to_string());
        args.push(self.graph.graph.to_filter_complex());
        args.extend(self.output_options.iter().cloned());
        args.push(output.to_string_lossy().into_owned());
        args
    }
}

/// Source frame rate capped at [`MAX_FRAME_RATE`]; unknown or zero rates use the cap
pub fn output_frame_rate(video: &VideoStream) -> f64 {
    match video.fps() {
        Some(fps) if fps <= MAX_FRAME_RATE => fps,
        _ => MAX_FRAME_RATE,
    }
}

fn format_secs(secs: f64) -> String {
    let rounded = (secs * 1000.0).round() / 1000.0;
    format!("{}", rounded)
}

fn format_rate(fps: f64) -> String {
    let rounded = (fps * 1000.0).round() / 1000.0;
    format!("{}", rounded)
}

fn format_kbps(kbps: f64) -> String {
    format!("{}k", kbps.round().max(1.0) as u64)
}
