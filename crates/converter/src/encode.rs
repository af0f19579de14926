use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use crate::error::{ConvertError, ConvertResult};
use crate::ffprobe::{FFProbeData, ProbedMedia, Prober};
use crate::plan::EncodePlan;

/// Lines of stderr kept in failure messages
const STDERR_TAIL_LINES: usize = 20;

/// Last state reported through `-progress`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeProgress {
    pub frame: u64,
    pub out_time_secs: f64,
    pub speed: Option<String>,
    pub finished: bool,
}

impl EncodeProgress {
    /// Fold one `key=value` line in; returns true when a progress block is complete
    pub fn apply(&mut self, line: &str) -> bool {
        let Some((key, value)) = line.trim().split_once('=') else {
            return false;
        };
        let value = value.trim();
        match key {
            "frame" => {
                if let Ok(frame) = value.parse() {
                    self.frame = frame;
                }
            }
            // Despite the name, ffmpeg reports microseconds here
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_secs = us.max(0) as f64 / 1_000_000.0;
                }
            }
            "speed" => self.speed = Some(value.to_string()),
            "progress" => {
                self.finished = value == "end";
                return true;
            }
            _ => {}
        }
        false
    }
}

/// A finished encode: the artifact and what ffprobe says about it
#[derive(Debug, Clone)]
pub struct EncodeResult {
    pub artifact_path: PathBuf,
    pub metadata: FFProbeData,
    pub media: ProbedMedia,
}

#[derive(Debug)]
struct RunOutput {
    progress: EncodeProgress,
}

#[derive(Debug)]
enum RunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    TimedOut(Duration),
    Exit { code: Option<i32>, stderr_tail: String },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Spawn(e) => write!(f, "failed to spawn ffmpeg: {}", e),
            RunError::Wait(e) => write!(f, "failed to wait for ffmpeg: {}", e),
            RunError::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs()),
            RunError::Exit { code, stderr_tail } => {
                write!(f, "exit code {}: {}", code.unwrap_or(-1), stderr_tail)
            }
        }
    }
}

/// Runs ffmpeg with a deadline
#[derive(Debug, Clone)]
pub struct FFmpegRunner {
    ffmpeg_bin: PathBuf,
    prober: Prober,
}

impl FFmpegRunner {
    pub fn new(ffmpeg_bin: PathBuf, prober: Prober) -> Self {
        Self { ffmpeg_bin, prober }
    }

    /// Encode `media_ref` per `plan` into `output`, then probe the artifact
    pub async fn encode(
        &self,
        job_id: &str,
        media_ref: &str,
        media: &ProbedMedia,
        plan: &EncodePlan,
        output: &Path,
        deadline: Duration,
    ) -> ConvertResult<EncodeResult> {
        let args = plan.ffmpeg_args(media_ref, output);
        info!(
            "Job {}: 🎬 Encoding {}x{} {:?} for {}s (deadline {}s)",
            job_id,
            plan.dimensions.width,
            plan.dimensions.height,
            plan.treatment(),
            plan.duration_secs,
            deadline.as_secs()
        );

        let run = self.run(job_id, &args, deadline).await.map_err(|e| match e {
            RunError::TimedOut(d) => ConvertError::EncodeTimeout { secs: d.as_secs() },
            other => ConvertError::EncodeFailed {
                message: other.to_string(),
                input: media_ref.to_string(),
                probed: describe_media(media),
            },
        })?;
        debug!(
            "Job {}: ffmpeg finished at frame {} ({:.2}s of output)",
            job_id, run.progress.frame, run.progress.out_time_secs
        );

        let (metadata, encoded) = self
            .prober
            .probe_media(&output.to_string_lossy())
            .await
            .map_err(|e| ConvertError::InvalidOutput {
                path: output.to_path_buf(),
                message: e.to_string(),
            })?;

        Ok(EncodeResult {
            artifact_path: output.to_path_buf(),
            metadata,
            media: encoded,
        })
    }

    /// Stream-copy the first `secs` seconds of `input` into `output`
    pub async fn trim(&self, job_id: &str, input: &Path, output: &Path, secs: f64, deadline: Duration) -> ConvertResult<()> {
        let args: Vec<String> = vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-v".to_string(),
            "error".to_string(),
            "-ss".to_string(),
            "0".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-t".to_string(),
            format!("{}", secs),
            "-c".to_string(),
            "copy".to_string(),
            output.to_string_lossy().into_owned(),
        ];

        self.run(job_id, &args, deadline)
            .await
            .map(|_| ())
            .map_err(|e| ConvertError::PostProcessFailed(format!("trim of {} failed: {}", input.display(), e)))
    }

    async fn run(&self, job_id: &str, args: &[String], deadline: Duration) -> Result<RunOutput, RunError> {
        debug!("Job {}: executing {} {}", job_id, self.ffmpeg_bin.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RunError::Spawn)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let progress_handle = tokio::spawn({
            let job_id = job_id.to_string();
            async move {
                let mut progress = EncodeProgress::default();
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        if progress.apply(&line) {
                            debug!(
                                "Job {}: progress frame={} time={:.2}s speed={}",
                                job_id,
                                progress.frame,
                                progress.out_time_secs,
                                progress.speed.as_deref().unwrap_or("?")
                            );
                        }
                    }
                }
                progress
            }
        });

        let stderr_handle = tokio::spawn(async move {
            let mut collected = Vec::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push(line);
                }
            }
            collected
        });

        let status = match timeout(deadline, child.wait()).await {
            Ok(result) => result.map_err(RunError::Wait)?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Job {}: failed to kill stuck ffmpeg process: {}", job_id, e);
                }
                progress_handle.abort();
                stderr_handle.abort();
                return Err(RunError::TimedOut(deadline));
            }
        };

        let progress = progress_handle.await.unwrap_or_default();
        let stderr_lines = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Err(RunError::Exit {
                code: status.code(),
                stderr_tail: tail(&stderr_lines, STDERR_TAIL_LINES),
            });
        }

        Ok(RunOutput { progress })
    }
}

/// One-line summary of the probed source for failure reports
fn describe_media(media: &ProbedMedia) -> String {
    format!(
        "{} {}x{} alpha={} duration={}",
        media.video.codec_name,
        media.video.width,
        media.video.height,
        media.video.alpha,
        media
            .duration
            .map(|d| format!("{:.2}s", d))
            .unwrap_or_else(|| "unknown".to_string())
    )
}

fn tail(lines: &[String], n: usize) -> String {
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
