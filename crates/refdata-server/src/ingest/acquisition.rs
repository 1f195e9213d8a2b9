//! Snapshot acquisition
//!
//! Downloads a registry snapshot, unpacks it to a plain CSV on local disk and
//! registers it as a PENDING [`SnapshotFile`]. A snapshot row only exists once
//! its artifact is complete, so a failed acquisition leaves nothing behind
//! but the job-level failure recorded by the caller.
//!
//! Transport failures are retried with a linearly growing delay and surface
//! as `NETWORK_ERROR`; an archive that cannot be unpacked surfaces as
//! `FILE_CORRUPTION`.
//!
//! Files written on the way are owned by an [`ArtifactGuard`] until the
//! artifact is registered, so errors and cancellation remove them.

use async_trait::async_trait;
use chrono::Utc;
use flate2::read::MultiGzDecoder;
use futures::StreamExt;
use reqwest::Client;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::IngestConfig;
use super::error::{IngestError, IngestResult};
use super::models::{ArtifactInfo, JobKind, SnapshotFile};
use super::store::IngestStore;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZIP_MAGIC: [u8; 4] = [b'P', b'K', 0x03, 0x04];

/// Payload encoding, detected from the leading bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Zip,
    Plain,
}

impl Compression {
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if head.starts_with(&ZIP_MAGIC) {
            Compression::Zip
        } else {
            Compression::Plain
        }
    }
}

/// Deletes its files on drop unless disarmed
///
/// Blocking work that outlives an abandoned future checks [`is_abandoned`]
/// after writing and cleans up after itself.
///
/// [`is_abandoned`]: ArtifactGuard::is_abandoned
pub struct ArtifactGuard {
    paths: Vec<PathBuf>,
    abandoned: Arc<AtomicBool>,
    armed: bool,
}

impl ArtifactGuard {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
            abandoned: Arc::new(AtomicBool::new(false)),
            armed: true,
        }
    }

    /// Flag shared with blocking writers; set once the guard fires
    pub fn is_abandoned(&self) -> Arc<AtomicBool> {
        self.abandoned.clone()
    }

    /// Keep the files
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.abandoned.store(true, Ordering::SeqCst);
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed partial artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial artifact"),
            }
        }
    }
}

fn remove_quietly(paths: &[&Path]) {
    for path in paths {
        let _ = std::fs::remove_file(path);
    }
}

/// Source of raw snapshot payloads
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fetch `source_uri` and leave the extracted CSV at `dest`
    async fn fetch(&self, source_uri: &str, dest: &Path) -> IngestResult<ArtifactInfo>;
}

/// HTTP(S) fetcher with retries
pub struct HttpFetcher {
    client: Client,
    attempts: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    pub fn new(config: &IngestConfig) -> IngestResult<Self> {
        let client = Client::builder()
            .timeout(config.download_timeout())
            .user_agent(concat!("refdata-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self::with_client(client, config.download_attempts, config.retry_delay()))
    }

    pub fn with_client(client: Client, attempts: u32, retry_delay: Duration) -> Self {
        Self {
            client,
            attempts: attempts.max(1),
            retry_delay,
        }
    }

    async fn download_with_retry(&self, url: &str, target: &Path) -> IngestResult<u64> {
        let mut attempt = 1;
        loop {
            match self.download(url, target).await {
                Ok(bytes) => return Ok(bytes),
                Err(e @ IngestError::Network(_)) if attempt < self.attempts => {
                    let delay = self.retry_delay * attempt;
                    warn!(
                        url,
                        attempt,
                        max_attempts = self.attempts,
                        error = %e,
                        "Download failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream the response body to `target` without buffering it in memory
    async fn download(&self, url: &str, target: &Path) -> IngestResult<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| IngestError::Network(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestError::Network(format!("{} returned HTTP {}", url, status)));
        }

        let mut file = tokio::fs::File::create(target).await?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| IngestError::Network(format!("{}: {}", url, e)))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

#[async_trait]
impl SnapshotFetcher for HttpFetcher {
    async fn fetch(&self, source_uri: &str, dest: &Path) -> IngestResult<ArtifactInfo> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let started = Instant::now();
        let archive = dest.with_extension("download");
        let guard = ArtifactGuard::new([
            archive.clone(),
            dest.with_extension("partial"),
            dest.to_path_buf(),
        ]);
        let downloaded = self.download_with_retry(source_uri, &archive).await?;

        let dest_owned = dest.to_path_buf();
        let abandoned = guard.is_abandoned();
        let unpacked = tokio::task::spawn_blocking(move || {
            let result = unpack(&archive, &dest_owned);
            let _ = std::fs::remove_file(&archive);
            // The caller went away while we were unpacking
            if abandoned.load(Ordering::SeqCst) {
                remove_quietly(&[&dest_owned, &dest_owned.with_extension("partial")]);
            }
            result
        })
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;

        let artifact = describe_artifact(dest).await?;
        guard.disarm();
        info!(
            url = source_uri,
            path = %dest.display(),
            downloaded_bytes = downloaded,
            extracted_bytes = artifact.bytes,
            compression = ?unpacked,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Snapshot downloaded"
        );

        Ok(artifact)
    }
}

/// Decode `archive` into `dest` according to its magic bytes
pub fn unpack(archive: &Path, dest: &Path) -> IngestResult<Compression> {
    let mut head = [0u8; 4];
    let read = File::open(archive)?.read(&mut head)?;
    let compression = Compression::detect(&head[..read]);

    let partial = dest.with_extension("partial");
    if let Err(e) = decode_into(archive, &partial, compression) {
        let _ = std::fs::remove_file(&partial);
        return Err(e);
    }

    std::fs::rename(&partial, dest)?;
    Ok(compression)
}

fn decode_into(archive: &Path, out_path: &Path, compression: Compression) -> IngestResult<()> {
    let corrupt = |what: &str, e: &dyn std::fmt::Display| {
        IngestError::FileCorruption(format!("{} {}: {}", what, archive.display(), e))
    };

    match compression {
        Compression::Gzip => {
            let mut decoder = MultiGzDecoder::new(BufReader::new(File::open(archive)?));
            let mut out = File::create(out_path)?;
            std::io::copy(&mut decoder, &mut out).map_err(|e| corrupt("gzip", &e))?;
        },
        Compression::Zip => {
            let mut zip = zip::ZipArchive::new(File::open(archive)?)
                .map_err(|e| corrupt("zip", &e))?;
            let mut csv_index = None;
            for i in 0..zip.len() {
                let entry = zip.by_index(i).map_err(|e| corrupt("zip", &e))?;
                if entry.name().to_ascii_lowercase().ends_with(".csv") {
                    csv_index = Some(i);
                    break;
                }
            }
            let index = csv_index.ok_or_else(|| corrupt("zip", &"no .csv entry"))?;
            let mut entry = zip.by_index(index).map_err(|e| corrupt("zip", &e))?;
            let mut out = File::create(out_path)?;
            std::io::copy(&mut entry, &mut out).map_err(|e| corrupt("zip", &e))?;
        },
        Compression::Plain => {
            std::fs::copy(archive, out_path)?;
        },
    }
    Ok(())
}

async fn describe_artifact(path: &Path) -> IngestResult<ArtifactInfo> {
    let owned = path.to_path_buf();
    let sha256 = tokio::task::spawn_blocking(move || refdata_common::checksum::sha256_file(owned))
        .await
        .map_err(|e| IngestError::Io(std::io::Error::other(e)))??;
    let bytes = tokio::fs::metadata(path).await?.len() as i64;

    Ok(ArtifactInfo {
        path: path.to_path_buf(),
        sha256,
        bytes,
    })
}

/// Acquires snapshots and registers them in the store
#[derive(Clone)]
pub struct Acquisition {
    fetcher: Arc<dyn SnapshotFetcher>,
    store: Arc<dyn IngestStore>,
    config: Arc<IngestConfig>,
}

impl Acquisition {
    pub fn new(
        fetcher: Arc<dyn SnapshotFetcher>,
        store: Arc<dyn IngestStore>,
        config: Arc<IngestConfig>,
    ) -> Self {
        Self {
            fetcher,
            store,
            config,
        }
    }

    /// Download the current snapshot of `kind` and register it as PENDING
    pub async fn acquire(&self, kind: JobKind) -> IngestResult<SnapshotFile> {
        let source_uri = self.config.source_url(kind).trim();
        if source_uri.is_empty() {
            return Err(IngestError::Config(format!("no source URL configured for {}", kind)));
        }

        let dest = self.artifact_path(kind);
        info!(kind = %kind, url = source_uri, path = %dest.display(), "Acquiring snapshot");

        let guard = ArtifactGuard::new([dest.clone()]);
        let artifact = self.fetcher.fetch(source_uri, &dest).await?;
        let snapshot = SnapshotFile::registered(kind, source_uri, artifact)
            .with_max_retries(self.config.max_retries);
        self.store.insert_snapshot(&snapshot).await?;
        guard.disarm();

        info!(
            kind = %kind,
            snapshot_id = %snapshot.id,
            bytes = snapshot.artifact_bytes,
            "Snapshot registered"
        );
        Ok(snapshot)
    }

    /// Re-download a snapshot's artifact if it is no longer on disk
    ///
    /// The checkpoint belongs to the original file, so a download whose
    /// checksum differs from the recorded one is rejected as corrupt.
    pub async fn ensure_artifact(&self, snapshot: &SnapshotFile) -> IngestResult<()> {
        if tokio::fs::try_exists(&snapshot.artifact_path).await? {
            return Ok(());
        }

        warn!(
            snapshot_id = %snapshot.id,
            path = %snapshot.artifact_path.display(),
            "Artifact missing, re-acquiring from source"
        );
        let guard = ArtifactGuard::new([snapshot.artifact_path.clone()]);
        let artifact = self
            .fetcher
            .fetch(&snapshot.source_uri, &snapshot.artifact_path)
            .await?;

        if let Some(expected) = snapshot.artifact_sha256.as_deref() {
            if expected != artifact.sha256 {
                return Err(IngestError::FileCorruption(format!(
                    "re-acquired artifact for snapshot {} has sha256 {}, expected {}",
                    snapshot.id, artifact.sha256, expected
                )));
            }
        }

        guard.disarm();
        Ok(())
    }

    fn artifact_path(&self, kind: JobKind) -> PathBuf {
        let suffix = Uuid::new_v4().simple().to_string();
        self.config.kind_dir(kind).join(format!(
            "{}-{}-{}.csv",
            kind,
            Utc::now().format("%Y%m%dT%H%M%SZ"),
            &suffix[..8]
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CSV: &str = "LEI,LegalName\nA,Alpha\n";

    fn fetcher(attempts: u32) -> HttpFetcher {
        HttpFetcher::with_client(Client::new(), attempts, Duration::ZERO)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn zipped(name: &str, data: &[u8]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file(name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap().into_inner()
    }

    async fn serve(server: &MockServer, route: &str, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    #[test]
    fn test_detect_compression() {
        assert_eq!(Compression::detect(&[0x1f, 0x8b, 8, 0]), Compression::Gzip);
        assert_eq!(Compression::detect(b"PK\x03\x04"), Compression::Zip);
        assert_eq!(Compression::detect(b"LEI,"), Compression::Plain);
        assert_eq!(Compression::detect(b""), Compression::Plain);
    }

    #[tokio::test]
    async fn test_fetch_gzip_and_zip() {
        let server = MockServer::start().await;
        serve(&server, "/full.csv.gz", gzip(CSV.as_bytes())).await;
        serve(&server, "/full.zip", zipped("golden.csv", CSV.as_bytes())).await;
        let dir = tempfile::tempdir().unwrap();

        for (route, name) in [("/full.csv.gz", "a.csv"), ("/full.zip", "b.csv")] {
            let dest = dir.path().join("full").join(name);
            let artifact = fetcher(1)
                .fetch(&format!("{}{}", server.uri(), route), &dest)
                .await
                .unwrap();

            assert_eq!(std::fs::read_to_string(&dest).unwrap(), CSV);
            assert_eq!(artifact.bytes, CSV.len() as i64);
            assert_eq!(artifact.sha256, refdata_common::checksum::sha256_file(&dest).unwrap());
            assert!(!dest.with_extension("download").exists());
        }
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let err = fetcher(3)
            .fetch(&format!("{}/delta.csv", server.uri()), &dir.path().join("d.csv"))
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Network(_)));
        assert!(!dir.path().join("d.csv").exists());
    }

    #[tokio::test]
    async fn test_broken_gzip_is_corruption() {
        let server = MockServer::start().await;
        let mut body = gzip(CSV.as_bytes());
        body.truncate(6);
        serve(&server, "/full.csv.gz", body).await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f.csv");

        let err = fetcher(3)
            .fetch(&format!("{}/full.csv.gz", server.uri()), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::FileCorruption(_)));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_guard_removes_files_unless_disarmed() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.csv");
        let dropped = dir.path().join("dropped.csv");
        std::fs::write(&kept, CSV).unwrap();
        std::fs::write(&dropped, CSV).unwrap();

        ArtifactGuard::new([kept.clone()]).disarm();
        let guard = ArtifactGuard::new([dropped.clone(), dir.path().join("never-written")]);
        let flag = guard.is_abandoned();
        drop(guard);

        assert!(kept.exists());
        assert!(!dropped.exists());
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zip_without_csv_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("x.download");
        std::fs::write(&archive, zipped("readme.txt", b"hello")).unwrap();

        let err = unpack(&archive, &dir.path().join("x.csv")).unwrap_err();
        assert!(matches!(err, IngestError::FileCorruption(_)));
    }
}
