use std::fmt;
use std::time::{Duration, Instant};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use humansize::{format_size, DECIMAL};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use crate::config::ConverterConfig;
use crate::encode::FFmpegRunner;
use crate::error::{ConvertError, ConvertResult};
use crate::ffprobe::{FFProbeData, Prober};
use crate::job::Job;
use crate::plan::EncodePlan;
use crate::postprocess::PostProcessor;
use crate::source::SourceResolver;
use crate::temp::TempArtifacts;

/// Payload of a completed job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutput {
    /// ffprobe document of the returned artifact
    pub metadata: FFProbeData,
    /// The sticker, base64 encoded
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Terminal failure of a job, qualified with the worker's host name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub host: String,
    /// Machine-readable error kind
    pub kind: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(host: &str, err: &ConvertError) -> Self {
        Self {
            host: host.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ::: {}", self.host, self.message)
    }
}

/// Name of this machine, used to qualify failures
pub fn host_name() -> String {
    System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}

/// Reject jobs that waited in the queue longer than `limit`
pub fn admit(job: &Job, now: DateTime<Utc>, limit: Duration) -> ConvertResult<()> {
    let age = job.age(now);
    if age.num_milliseconds() > limit.as_millis() as i64 {
        return Err(ConvertError::StaleJob {
            age_secs: age.num_seconds(),
            limit_secs: limit.as_secs(),
        });
    }
    Ok(())
}

/// Drives one job through resolve, probe, plan, encode and post-process
#[derive(Debug, Clone)]
pub struct Converter {
    cfg: ConverterConfig,
    resolver: SourceResolver,
    prober: Prober,
    runner: FFmpegRunner,
    host: String,
}

impl Converter {
    pub fn new(cfg: ConverterConfig) -> anyhow::Result<Self> {
        let resolver = SourceResolver::new(Duration::from_secs(cfg.download_timeout_secs))?;
        let prober = Prober::new(cfg.ffprobe_bin.clone())
            .with_timeout(Duration::from_secs(cfg.probe_timeout_secs.max(1)));
        let runner = FFmpegRunner::new(cfg.ffmpeg_bin.clone(), prober.clone());
        Ok(Self {
            cfg,
            resolver,
            prober,
            runner,
            host: host_name(),
        })
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.cfg
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn process(&self, job: &Job) -> Result<JobOutput, JobFailure> {
        self.process_at(job, Utc::now()).await
    }

    /// Process with an explicit admission clock
    pub async fn process_at(&self, job: &Job, now: DateTime<Utc>) -> Result<JobOutput, JobFailure> {
        let started = Instant::now();

        if let Err(e) = admit(job, now, self.cfg.stale_after()) {
            error!("❌ Job {} rejected: {}", job.id, e);
            return Err(JobFailure::new(&self.host, &e));
        }

        let mut temps = TempArtifacts::new(&self.cfg.temp_dir);
        let result = self.run_stages(job, &mut temps).await;
        temps.cleanup().await;

        match result {
            Ok(output) => {
                info!(
                    "✅ Job {} completed in {:.1}s",
                    job.id,
                    started.elapsed().as_secs_f64()
                );
                Ok(output)
            }
            Err(e) => {
                let failure = JobFailure::new(&self.host, &e);
                error!(
                    "❌ Job {} failed after {:.1}s: {}",
                    job.id,
                    started.elapsed().as_secs_f64(),
                    failure
                );
                Err(failure)
            }
        }
    }

    async fn run_stages(&self, job: &Job, temps: &mut TempArtifacts) -> ConvertResult<JobOutput> {
        info!("Job {}: 📥 Resolving source {}", job.id, job.input.describe());
        let source = self.resolver.resolve(&job.input, temps).await?;
        debug!("Job {}: source resolved as {:?}", job.id, source.origin);

        let (_, media) = self.prober.probe_media(&source.reference).await?;
        info!(
            "Job {}: 🔍 Probed {} {}x{} duration={}",
            job.id,
            media.video.codec_name,
            media.video.width,
            media.video.height,
            media
                .duration
                .map(|d| format!("{:.2}s", d))
                .unwrap_or_else(|| "unknown".to_string())
        );

        let plan = EncodePlan::build(job, &media, &self.cfg)?;
        info!(
            "Job {}: 🧮 Plan {:?}, {}s at {:.0}kbps (max {:.0}kbps), {}x{} @ {}fps",
            job.id,
            plan.treatment(),
            plan.duration_secs,
            plan.bitrate_kbps,
            plan.maxrate_kbps,
            plan.dimensions.width,
            plan.dimensions.height,
            plan.frame_rate
        );

        temps.prepare().await?;
        let output = temps.allocate("webm");
        let max_duration = job.max_duration.unwrap_or(self.cfg.default_max_duration);
        let deadline = Duration::from_secs(u64::from(max_duration) + self.cfg.encode_grace_secs);

        let encoded = self
            .runner
            .encode(&job.id, &source.reference, &media, &plan, &output, deadline)
            .await?;

        let artifact = PostProcessor::new(&self.runner, &self.prober)
            .run(&job.id, job.is_emoji, media.duration, encoded, temps, deadline)
            .await?;

        let bytes = tokio::fs::read(&artifact.path).await?;
        info!(
            "Job {}: 📦 Sticker ready ({}, {:?})",
            job.id,
            format_size(bytes.len() as u64, DECIMAL),
            artifact.action
        );

        Ok(JobOutput {
            metadata: artifact.metadata,
            content: STANDARD.encode(&bytes),
            tag: job.tag.clone(),
        })
    }
}
