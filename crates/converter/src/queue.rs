use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use crate::job::Job;
use crate::pipeline::{JobFailure, JobOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A job plus its lifecycle, persisted as `<id>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub status: JobStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<JobOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl JobRecord {
    pub fn pending(job: Job) -> Self {
        Self {
            job,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }
}

/// Job queue backed by a directory of JSON records
///
/// Every read-modify-write goes through one async lock, so concurrent workers
/// in this process never claim the same record.
#[derive(Debug)]
pub struct JobStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the state directory exists
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create job state directory: {}", self.dir.display()))
    }

    pub async fn enqueue(&self, job: Job) -> Result<JobRecord> {
        let _guard = self.lock.lock().await;
        let path = self.record_path(&job.id)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            bail!("Job {} already exists", job.id);
        }
        let record = JobRecord::pending(job);
        self.save(&record).await?;
        info!("📝 Enqueued job {}: {}", record.job.id, record.job.input.describe());
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let path = self.record_path(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse job record: {}", path.display()))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read job record: {}", path.display())),
        }
    }

    /// Mark the oldest pending job as running and return it
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let _guard = self.lock.lock().await;
        let mut pending: Vec<JobRecord> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.status == JobStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            a.job
                .enqueued_at
                .cmp(&b.job.enqueued_at)
                .then_with(|| a.job.id.cmp(&b.job.id))
        });

        let Some(mut record) = pending.into_iter().next() else {
            return Ok(None);
        };
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        self.save(&record).await?;
        debug!("Claimed job {}", record.job.id);
        Ok(Some(record.job))
    }

    /// Record the terminal outcome of a claimed job
    pub async fn complete(&self, id: &str, outcome: Result<JobOutput, JobFailure>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut record = self
            .get(id)
            .await?
            .with_context(|| format!("Job {} vanished before completion", id))?;

        record.finished_at = Some(Utc::now());
        match outcome {
            Ok(output) => {
                record.status = JobStatus::Completed;
                record.output = Some(output);
                record.error = None;
            }
            Err(failure) => {
                record.status = JobStatus::Failed;
                record.output = None;
                record.error = Some(failure);
            }
        }
        self.save(&record).await
    }

    /// Delete finished records older than `retention`; returns how many were removed
    pub async fn clean(&self, retention: Duration, now: DateTime<Utc>) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let mut removed = 0;

        for record in self.load_all().await? {
            let expired = record.status.is_finished()
                && record
                    .finished_at
                    .map(|finished| now - finished > retention)
                    .unwrap_or(true);
            if !expired {
                continue;
            }
            let path = self.record_path(&record.job.id)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove job record {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            debug!("🧹 Removed {} finished job record(s)", removed);
        }
        Ok(removed)
    }

    /// Records left running by a previous process become failed; nothing is retried
    pub async fn recover_interrupted(&self, host: &str) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut recovered = 0;

        for mut record in self.load_all().await? {
            if record.status != JobStatus::Running {
                continue;
            }
            warn!("⚠️  Job {} was interrupted, marking failed", record.job.id);
            record.status = JobStatus::Failed;
            record.finished_at = Some(Utc::now());
            record.error = Some(JobFailure {
                host: host.to_string(),
                kind: "interrupted".to_string(),
                message: "worker stopped while the job was running".to_string(),
            });
            self.save(&record).await?;
            recovered += 1;
        }

        Ok(recovered)
    }

    /// All readable records; corrupt files are skipped with a warning
    pub async fn load_all(&self) -> Result<Vec<JobRecord>> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list job directory: {}", self.dir.display()))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list job directory: {}", self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                // Removed by a concurrent clean
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("Failed to read job record {}: {}", path.display(), e);
                    continue;
                }
            };
            match serde_json::from_slice::<JobRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unparseable job record {}: {}", path.display(), e),
            }
        }

        Ok(records)
    }

    async fn save(&self, record: &JobRecord) -> Result<()> {
        let path = self.record_path(&record.job.id)?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record).context("Failed to serialize job record")?;

        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write job record: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move job record into place: {}", path.display()))?;
        Ok(())
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            bail!("Invalid job id: {:?}", id);
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffprobe::FFProbeData;
    use crate::job::JobInput;

    fn job_at(id: &str, enqueued_at: DateTime<Utc>) -> Job {
        let mut job = Job::new(JobInput::Url { url: format!("https://example.com/{}.mp4", id) });
        job.id = id.to_string();
        job.enqueued_at = enqueued_at;
        job
    }

    fn output() -> JobOutput {
        JobOutput {
            metadata: FFProbeData::default(),
            content: "AAAA".to_string(),
            tag: Some("chat-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_claim_oldest_first_and_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.init().await.unwrap();
        let now = Utc::now();

        store.enqueue(job_at("newer", now)).await.unwrap();
        store.enqueue(job_at("older", now - chrono::Duration::seconds(5))).await.unwrap();

        assert_eq!(store.claim_next().await.unwrap().unwrap().id, "older");
        assert_eq!(store.claim_next().await.unwrap().unwrap().id, "newer");
        assert!(store.claim_next().await.unwrap().is_none());

        let record = store.get("older").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_a_job() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(JobStore::new(dir.path()));
        store.init().await.unwrap();
        for i in 0..8 {
            store.enqueue(job_at(&format!("job-{}", i), Utc::now())).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next().await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 8);
    }

    #[tokio::test]
    async fn test_complete_and_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.init().await.unwrap();
        store.enqueue(job_at("ok", Utc::now())).await.unwrap();
        store.enqueue(job_at("bad", Utc::now())).await.unwrap();
        store.enqueue(job_at("waiting", Utc::now())).await.unwrap();

        store.complete("ok", Ok(output())).await.unwrap();
        store
            .complete(
                "bad",
                Err(JobFailure {
                    host: "h".to_string(),
                    kind: "probe_failed".to_string(),
                    message: "boom".to_string(),
                }),
            )
            .await
            .unwrap();

        let ok = store.get("ok").await.unwrap().unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.output.unwrap().tag.as_deref(), Some("chat-1"));
        let bad = store.get("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert_eq!(bad.error.unwrap().to_string(), "h ::: boom");

        // Inside the retention window nothing goes
        assert_eq!(store.clean(Duration::from_secs(60), Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(store.clean(Duration::from_secs(60), later).await.unwrap(), 2);
        assert!(store.get("ok").await.unwrap().is_none());
        assert!(store.get("waiting").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.init().await.unwrap();
        store.enqueue(job_at("a", Utc::now())).await.unwrap();
        store.enqueue(job_at("b", Utc::now() + chrono::Duration::seconds(1))).await.unwrap();
        store.claim_next().await.unwrap();

        assert_eq!(store.recover_interrupted("host-1").await.unwrap(), 1);
        let a = store.get("a").await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Failed);
        assert_eq!(a.error.unwrap().kind, "interrupted");
        assert_eq!(store.get("b").await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_bad_ids_and_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        store.init().await.unwrap();

        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("").await.is_err());
        assert!(store.get("unknown").await.unwrap().is_none());

        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        store.enqueue(job_at("fine", Utc::now())).await.unwrap();
        assert!(store.enqueue(job_at("fine", Utc::now())).await.is_err());
        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
