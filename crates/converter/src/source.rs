//! Turns a job input into something ffprobe and ffmpeg can open.

use std::path::Path;
use std::time::Duration;
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::{redirect, Client};
use tokio::io::AsyncWriteExt;
use url::Url;
use crate::error::{ConvertError, ConvertResult};
use crate::job::JobInput;
use crate::temp::TempArtifacts;

/// How the reference was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Inline payload written to a temp file
    Inline,
    /// Plain http URL handed to ffmpeg as is
    Passthrough,
    /// https URL downloaded to a temp file
    Downloaded,
    /// https URL handed to ffmpeg after the download failed
    DownloadFallback,
    LocalPath,
}

/// Reference consumable by the probe and encode steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSource {
    pub reference: String,
    pub origin: SourceOrigin,
}

#[derive(Debug, Clone)]
pub struct SourceResolver {
    client: Client,
}

impl SourceResolver {
    pub fn new(download_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("stickerd/", env!("CARGO_PKG_VERSION")))
            .redirect(redirect::Policy::limited(1))
            .timeout(download_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    /// Resolve a job input; downloaded and decoded files are tracked in `temps`
    pub async fn resolve(&self, input: &JobInput, temps: &mut TempArtifacts) -> ConvertResult<ResolvedSource> {
        match input {
            JobInput::Inline { data } => {
                let bytes = decode_inline(data)?;
                temps.prepare().await?;
                let path = temps.allocate("src");
                tokio::fs::write(&path, &bytes).await?;
                debug!("Materialized inline payload ({} bytes) at {}", bytes.len(), path.display());
                Ok(ResolvedSource {
                    reference: path.to_string_lossy().into_owned(),
                    origin: SourceOrigin::Inline,
                })
            }
            JobInput::Url { url } => self.resolve_url(url, temps).await,
            JobInput::Path { path } => {
                if !path.is_file() {
                    return Err(ConvertError::InvalidInput(format!(
                        "source file does not exist: {}",
                        path.display()
                    )));
                }
                Ok(ResolvedSource {
                    reference: path.to_string_lossy().into_owned(),
                    origin: SourceOrigin::LocalPath,
                })
            }
        }
    }

    async fn resolve_url(&self, raw: &str, temps: &mut TempArtifacts) -> ConvertResult<ResolvedSource> {
        let url = Url::parse(raw.trim())
            .map_err(|e| ConvertError::InvalidInput(format!("unparseable URL {:?}: {}", raw, e)))?;

        match url.scheme() {
            "http" => Ok(ResolvedSource {
                reference: raw.to_string(),
                origin: SourceOrigin::Passthrough,
            }),
            "https" => {
                temps.prepare().await?;
                let path = temps.allocate("src");
                match self.download_to(url.as_str(), &path).await {
                    Ok(bytes) => {
                        info!("⬇️  Downloaded {} ({} bytes)", url, bytes);
                        Ok(ResolvedSource {
                            reference: path.to_string_lossy().into_owned(),
                            origin: SourceOrigin::Downloaded,
                        })
                    }
                    Err(e) => {
                        warn!("{}; letting ffmpeg read the URL directly", e);
                        Ok(ResolvedSource {
                            reference: raw.to_string(),
                            origin: SourceOrigin::DownloadFallback,
                        })
                    }
                }
            }
            other => Err(ConvertError::InvalidInput(format!(
                "unsupported URL scheme {:?} in {}",
                other, raw
            ))),
        }
    }

    /// Stream a URL into `path`, returning the byte count
    pub async fn download_to(&self, url: &str, path: &Path) -> ConvertResult<u64> {
        let failed = |message: String| ConvertError::DownloadFailed {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| failed(e.to_string()))?;

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| failed(format!("cannot create {}: {}", path.display(), e)))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let data = chunk.map_err(|e| failed(e.to_string()))?;
            file.write_all(&data)
                .await
                .map_err(|e| failed(format!("write to {} failed: {}", path.display(), e)))?;
            written += data.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| failed(format!("flush of {} failed: {}", path.display(), e)))?;

        Ok(written)
    }
}

/// Decode a base64 payload, accepting a `data:<mime>;base64,` prefix
pub fn decode_inline(data: &str) -> ConvertResult<Vec<u8>> {
    let trimmed = data.trim();
    let payload = match trimmed.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| ConvertError::InvalidInput("data URI without payload".to_string()))?;
            if !header.ends_with(";base64") {
                return Err(ConvertError::InvalidInput(
                    "data URI is not base64 encoded".to_string(),
                ));
            }
            payload
        }
        None => trimmed,
    };

    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if compact.is_empty() {
        return Err(ConvertError::InvalidInput("empty inline payload".to_string()));
    }

    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| ConvertError::InvalidInput(format!("inline payload is not valid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver() -> SourceResolver {
        SourceResolver::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_decode_raw_and_data_uri() {
        assert_eq!(decode_inline("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_inline("data:video/webm;base64,aGVs\nbG8=").unwrap(), b"hello");
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        assert!(matches!(decode_inline("   "), Err(ConvertError::InvalidInput(_))));
        assert!(matches!(decode_inline("data:text/plain,hello"), Err(ConvertError::InvalidInput(_))));
        assert!(matches!(decode_inline("data:video/mp4;base64"), Err(ConvertError::InvalidInput(_))));
        assert!(matches!(decode_inline("!!not base64!!"), Err(ConvertError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_inline_is_written_and_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut temps = TempArtifacts::new(dir.path().join("tmp"));
        let input = JobInput::Inline { data: STANDARD.encode(b"GIF89a....") };

        let resolved = resolver().resolve(&input, &mut temps).await.unwrap();
        assert_eq!(resolved.origin, SourceOrigin::Inline);
        assert_eq!(std::fs::read(&resolved.reference).unwrap(), b"GIF89a....");
        assert_eq!(temps.tracked(), &[PathBuf::from(&resolved.reference)]);

        temps.cleanup().await;
        assert!(!Path::new(&resolved.reference).exists());
    }

    #[tokio::test]
    async fn test_plain_http_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let mut temps = TempArtifacts::new(dir.path());
        let input = JobInput::Url { url: "http://cdn.example.com/clip.mp4".to_string() };

        let resolved = resolver().resolve(&input, &mut temps).await.unwrap();
        assert_eq!(resolved.origin, SourceOrigin::Passthrough);
        assert_eq!(resolved.reference, "http://cdn.example.com/clip.mp4");
        assert!(temps.tracked().is_empty());
    }

    #[tokio::test]
    async fn test_url_is_handed_over_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let mut temps = TempArtifacts::new(dir.path());
        let r = resolver();

        let raw = "http://CDN.example.com/a b.mp4";
        let resolved = r.resolve(&JobInput::Url { url: raw.to_string() }, &mut temps).await.unwrap();
        assert_eq!(resolved.origin, SourceOrigin::Passthrough);
        assert_eq!(resolved.reference, raw);

        let raw = "https://LOCALHOST:9/Clip.mp4";
        let resolved = r.resolve(&JobInput::Url { url: raw.to_string() }, &mut temps).await.unwrap();
        assert_eq!(resolved.origin, SourceOrigin::DownloadFallback);
        assert_eq!(resolved.reference, raw);
    }

    #[tokio::test]
    async fn test_https_download_failure_falls_back_to_url() {
        let dir = tempfile::tempdir().unwrap();
        let mut temps = TempArtifacts::new(dir.path());
        let url = "https://127.0.0.1:9/clip.mp4";
        let input = JobInput::Url { url: url.to_string() };

        let resolved = resolver().resolve(&input, &mut temps).await.unwrap();
        assert_eq!(resolved.origin, SourceOrigin::DownloadFallback);
        assert_eq!(resolved.reference, url);
        // The reserved download path is still tracked for cleanup
        assert_eq!(temps.tracked().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut temps = TempArtifacts::new(dir.path());
        let r = resolver();

        for input in [
            JobInput::Url { url: "ftp://example.com/a.gif".to_string() },
            JobInput::Url { url: "not a url".to_string() },
            JobInput::Path { path: dir.path().join("missing.mp4") },
        ] {
            match r.resolve(&input, &mut temps).await {
                Err(ConvertError::InvalidInput(_)) => {}
                other => panic!("expected InvalidInput for {:?}, got {:?}", input, other),
            }
        }
    }

    #[tokio::test]
    async fn test_download_follows_one_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/short"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("Location", format!("{}/clip.mp4", server.uri()).as_str()),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 1024]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("clip.src");
        let written = resolver()
            .download_to(&format!("{}/short", server.uri()), &target)
            .await
            .unwrap();
        assert_eq!(written, 1024);
        assert_eq!(std::fs::read(&target).unwrap(), vec![7u8; 1024]);
    }

    #[tokio::test]
    async fn test_download_rejects_second_redirect_and_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("{}/b", server.uri()).as_str()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", format!("{}/c", server.uri()).as_str()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let r = resolver();
        for route in ["/a", "/missing"] {
            let url = format!("{}{}", server.uri(), route);
            match r.download_to(&url, &dir.path().join("x.src")).await {
                Err(ConvertError::DownloadFailed { url: failed, .. }) => assert_eq!(failed, url),
                other => panic!("expected DownloadFailed for {}, got {:?}", route, other),
            }
        }
    }
}
