//! End-to-end job processing against scripted stand-ins for ffprobe and ffmpeg.
//!
//! The fake tools speak a tiny text format: media files start with
//! `DUR=`, `CODEC=`, `W=` and `H=` lines, which the fake ffprobe turns into
//! JSON. The fake ffmpeg writes such a header for its output (duration taken
//! from the last `-t`) followed by a Matroska-like duration element.
//! Flag files in the harness directory switch either tool into a failure mode.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use converter::{Converter, ConverterConfig, FrameShape, Job, JobInput};
use serial_test::serial;
use tempfile::TempDir;

const FAKE_FFPROBE: &str = r#"#!/bin/sh
echo "$@" >> "@DIR@/ffprobe.log"
if [ -f "@DIR@/probe_hang" ]; then exec sleep 60; fi
for last in "$@"; do :; done
case "$last" in
  *sticker-*.webm) if [ -f "@DIR@/bad_output" ]; then echo "$last: bad" >&2; exit 1; fi ;;
esac
if [ ! -f "$last" ]; then echo "$last: No such file or directory" >&2; exit 1; fi
codec=$(sed -n 's/^CODEC=//p' "$last")
if [ -z "$codec" ]; then echo "$last: Invalid data found when processing input" >&2; exit 1; fi
dur=$(sed -n 's/^DUR=//p' "$last")
w=$(sed -n 's/^W=//p' "$last")
h=$(sed -n 's/^H=//p' "$last")
printf '{"streams":[{"index":0,"codec_type":"video","codec_name":"%s","width":%s,"height":%s,"r_frame_rate":"30/1"}],"format":{"duration":"%s"}}\n' "$codec" "$w" "$h" "$dur"
"#;

const FAKE_FFMPEG: &str = r#"#!/bin/sh
echo "$@" >> "@DIR@/ffmpeg.log"
if [ -f "@DIR@/hang" ]; then exec sleep 30; fi
if [ -f "@DIR@/fail" ]; then
  echo "Error reinitializing filters!" >&2
  echo "Conversion failed!" >&2
  exit 1
fi
prev=""; t=""; out=""
for a in "$@"; do
  if [ "$prev" = "-t" ]; then t="$a"; fi
  prev="$a"; out="$a"
done
printf 'DUR=%s\nCODEC=vp9\nW=512\nH=512\n' "$t" > "$out"
if [ ! -f "@DIR@/no_marker" ]; then
  printf '\032\105\337\243\104\211\000\000\000\000\n' >> "$out"
fi
echo "frame=30"
echo "out_time_us=1000000"
echo "speed=1x"
echo "progress=end"
"#;

struct Harness {
    dir: TempDir,
    cfg: ConverterConfig,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let ffprobe = write_script(&bin.join("ffprobe"), FAKE_FFPROBE, dir.path());
        let ffmpeg = write_script(&bin.join("ffmpeg"), FAKE_FFMPEG, dir.path());

        let cfg = ConverterConfig {
            ffprobe_bin: ffprobe,
            ffmpeg_bin: ffmpeg,
            temp_dir: dir.path().join("tmp"),
            job_state_dir: dir.path().join("jobs"),
            assets_dir: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets"),
            ..ConverterConfig::default()
        };
        Self { dir, cfg }
    }

    fn source(&self, name: &str, codec: &str, width: u32, height: u32, duration: &str) -> Job {
        let path = self.dir.path().join(name);
        std::fs::write(
            &path,
            format!("DUR={}\nCODEC={}\nW={}\nH={}\n", duration, codec, width, height),
        )
        .unwrap();
        Job::new(JobInput::Path { path })
    }

    fn converter(&self) -> Converter {
        Converter::new(self.cfg.clone()).unwrap()
    }

    fn log(&self, tool: &str) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join(format!("{}.log", tool)))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn flag(&self, name: &str) {
        std::fs::write(self.dir.path().join(name), b"").unwrap();
    }

    fn temp_files(&self) -> usize {
        std::fs::read_dir(&self.cfg.temp_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn write_script(path: &Path, body: &str, dir: &Path) -> PathBuf {
    std::fs::write(path, body.replace("@DIR@", &dir.to_string_lossy())).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

fn duration_field(bytes: &[u8]) -> Option<[u8; 4]> {
    let pos = bytes.windows(2).position(|w| w == [0x44u8, 0x89])?;
    bytes.get(pos + 2..pos + 6).map(|f| [f[0], f[1], f[2], f[3]])
}

#[tokio::test]
#[serial]
async fn test_long_standard_clip_is_patched() {
    let h = Harness::new();
    let mut job = h.source("clip.mp4", "h264", 1280, 720, "5.0");
    job.tag = Some("chat-42".to_string());

    let output = h.converter().process(&job).await.unwrap();

    assert_eq!(output.tag.as_deref(), Some("chat-42"));
    assert_eq!(output.metadata.format.duration.as_deref(), Some("5"));
    let bytes = STANDARD.decode(&output.content).unwrap();
    assert_eq!(duration_field(&bytes), Some(1_000_000u32.to_le_bytes()));

    let ffmpeg = h.log("ffmpeg");
    assert_eq!(ffmpeg.len(), 1);
    assert!(ffmpeg[0].contains("-progress pipe:1"));
    assert!(ffmpeg[0].contains("-b:v 279k -maxrate 418k -bufsize 2000k"));
    assert!(ffmpeg[0].contains("force_original_aspect_ratio=decrease"));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_short_clip_is_returned_unchanged() {
    let h = Harness::new();
    let job = h.source("short.mp4", "h264", 640, 640, "2.0");

    let output = h.converter().process(&job).await.unwrap();

    let bytes = STANDARD.decode(&output.content).unwrap();
    assert_eq!(duration_field(&bytes), Some([0, 0, 0, 0]));
    assert_eq!(output.metadata.format.duration.as_deref(), Some("2"));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_long_emoji_is_trimmed_by_stream_copy() {
    let h = Harness::new();
    let job = h.source("emoji.mp4", "h264", 640, 480, "5.0").with_emoji(true);

    let output = h.converter().process(&job).await.unwrap();

    let ffmpeg = h.log("ffmpeg");
    assert_eq!(ffmpeg.len(), 2);
    assert!(ffmpeg[0].contains("scale=w=100:h=100"));
    assert!(ffmpeg[1].starts_with("-y -hide_banner -v error -ss 0 -i "));
    assert!(ffmpeg[1].contains("-t 2.9 -c copy"));
    assert_eq!(output.metadata.format.duration.as_deref(), Some("2.9"));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_circle_shape_feeds_mask_template() {
    let h = Harness::new();
    let job = h
        .source("round.mp4", "h264", 1280, 720, "2.0")
        .with_shape(FrameShape::Circle);

    h.converter().process(&job).await.unwrap();

    let ffmpeg = h.log("ffmpeg");
    assert!(ffmpeg[0].contains("circle.png"));
    assert!(ffmpeg[0].contains("[sticker][mask]alphamerge"));
}

#[tokio::test]
#[serial]
async fn test_stale_job_is_never_probed() {
    let h = Harness::new();
    let mut job = h.source("old.mp4", "h264", 640, 640, "5.0");
    job.enqueued_at = Utc::now() - chrono::Duration::minutes(11);

    let failure = h.converter().process(&job).await.unwrap_err();

    assert_eq!(failure.kind, "stale_job");
    assert!(failure.to_string().contains(" ::: job is too old"));
    assert!(h.log("ffprobe").is_empty());
    assert!(h.log("ffmpeg").is_empty());
}

#[tokio::test]
#[serial]
async fn test_hung_encode_is_killed_at_deadline() {
    let mut h = Harness::new();
    h.cfg.encode_grace_secs = 1;
    h.flag("hang");
    let mut job = h.source("slow.mp4", "h264", 640, 640, "5.0");
    job.max_duration = Some(1);

    let started = std::time::Instant::now();
    let failure = h.converter().process(&job).await.unwrap_err();

    assert_eq!(failure.kind, "encode_timeout");
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_encode_failure_carries_stderr_and_source() {
    let h = Harness::new();
    h.flag("fail");
    let job = h.source("broken.mp4", "h264", 640, 640, "5.0");

    let failure = h.converter().process(&job).await.unwrap_err();

    assert_eq!(failure.kind, "encode_failed");
    assert!(failure.message.contains("Conversion failed!"));
    assert!(failure.message.contains("broken.mp4"));
    assert!(failure.message.contains("h264 640x640"));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_unprobeable_source() {
    let h = Harness::new();
    let path = h.dir.path().join("noise.bin");
    std::fs::write(&path, b"random bytes").unwrap();
    let job = Job::new(JobInput::Path { path });

    let failure = h.converter().process(&job).await.unwrap_err();

    assert_eq!(failure.kind, "probe_failed");
    assert!(failure.message.contains("Invalid data found"));
    assert!(h.log("ffmpeg").is_empty());
}

#[tokio::test]
#[serial]
async fn test_inline_source_is_materialized_and_removed() {
    let h = Harness::new();
    let payload = STANDARD.encode(b"DUR=1.5\nCODEC=gif\nW=300\nH=200\n");
    let job = Job::new(JobInput::Inline { data: format!("data:image/gif;base64,{}", payload) });

    h.converter().process(&job).await.unwrap();

    let ffmpeg = h.log("ffmpeg");
    assert!(ffmpeg[0].contains("pad=w=512:h=200:x=-1:y=-1:color=black@0"));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_long_clip_without_marker_is_returned_unpatched() {
    let h = Harness::new();
    h.flag("no_marker");
    let job = h.source("nomarker.mp4", "h264", 1280, 720, "5.0");

    let output = h.converter().process(&job).await.unwrap();

    let bytes = STANDARD.decode(&output.content).unwrap();
    assert_eq!(duration_field(&bytes), None);
    assert_eq!(bytes, b"DUR=5\nCODEC=vp9\nW=512\nH=512\n".to_vec());
    assert_eq!(output.metadata.format.duration.as_deref(), Some("5"));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_short_emoji_encode_skips_trim() {
    let h = Harness::new();
    let mut job = h.source("brief.mp4", "h264", 640, 480, "5.0").with_emoji(true);
    job.max_duration = Some(2);

    let output = h.converter().process(&job).await.unwrap();

    assert_eq!(h.log("ffmpeg").len(), 1);
    assert_eq!(output.metadata.format.duration.as_deref(), Some("2"));
    assert_eq!(h.temp_files(), 0);
}

#[tokio::test]
#[serial]
async fn test_stalled_probe_of_remote_source_times_out() {
    let mut h = Harness::new();
    h.cfg.probe_timeout_secs = 1;
    h.cfg.encode_grace_secs = 1;
    h.flag("probe_hang");
    let mut job = Job::new(JobInput::Url { url: "http://stalled.example/clip.mp4".to_string() });
    job.max_duration = Some(1);

    let started = std::time::Instant::now();
    let failure = h.converter().process(&job).await.unwrap_err();

    assert_eq!(failure.kind, "probe_failed");
    assert!(failure.message.contains("timed out"));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    assert!(h.log("ffmpeg").is_empty());
}

#[tokio::test]
#[serial]
async fn test_unreadable_encode_output_is_invalid_output() {
    let h = Harness::new();
    h.flag("bad_output");
    let job = h.source("garbled.mp4", "h264", 640, 640, "2.0");

    let failure = h.converter().process(&job).await.unwrap_err();

    assert_eq!(failure.kind, "invalid_output");
    assert!(failure.message.contains("bad"));
    assert_eq!(h.log("ffmpeg").len(), 1);
    assert_eq!(h.temp_files(), 0);
}
