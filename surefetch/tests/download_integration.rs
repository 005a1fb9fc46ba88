//! End-to-end download scenarios against local HTTP servers.
//!
//! Most scenarios use wiremock. Interruption and cancellation need a server
//! that stops mid-body, so those run against a raw TCP listener.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use md5::{Digest, Md5};
use sha2::Sha256;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use surefetch::download::{
    DownloadManager, DownloadOutcome, EnhancedDownloadProgress, HashAlgorithm, Phase, ProgressSink,
};
use surefetch::{DownloadConfiguration, DownloadError, DownloadOptions};

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default, Clone)]
struct Recorder(Arc<Mutex<Vec<EnhancedDownloadProgress>>>);

impl ProgressSink for Recorder {
    fn emit(&self, progress: &EnhancedDownloadProgress) {
        self.0.lock().unwrap().push(progress.clone());
    }
}

impl Recorder {
    fn events(&self) -> Vec<EnhancedDownloadProgress> {
        self.0.lock().unwrap().clone()
    }

    fn max_bytes(&self) -> u64 {
        self.events()
            .iter()
            .map(|e| e.bytes_downloaded)
            .max()
            .unwrap_or(0)
    }
}

fn test_config() -> DownloadConfiguration {
    DownloadConfiguration::default()
        .with_backoff(Duration::from_millis(10), Duration::from_millis(50))
        .with_progress_interval(Duration::ZERO)
        .with_resume_threshold(1)
}

fn manager() -> DownloadManager {
    DownloadManager::with_config(test_config()).unwrap()
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// =============================================================================
// Basic transfers
// =============================================================================

#[tokio::test]
async fn test_plain_download_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hello.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"Hello, World!".to_vec()))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("hello.txt");
    let recorder = Recorder::default();

    let result = manager()
        .download(&format!("{}/hello.txt", server.uri()), &dest, None, Some(&recorder))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.outcome, DownloadOutcome::Completed);
    assert_eq!(result.bytes_downloaded, 13);
    assert_eq!(result.file_path, dest);
    assert_eq!(result.retry_attempts, 0);
    assert!(!result.was_resumed);
    assert_eq!(result.hash_verified, None);
    assert!(result.error.is_none());
    assert_eq!(std::fs::read(&dest).unwrap(), b"Hello, World!");
    assert!(!part_path(&dest).exists());

    let events = recorder.events();
    let last = events.last().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.phase, Phase::Complete);
    assert_eq!(
        events.iter().filter(|e| e.phase.is_terminal()).count(),
        1,
        "exactly one terminal event"
    );
}

#[tokio::test]
async fn test_sends_user_agent_and_custom_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.bin"))
        .and(header("user-agent", "installer/2.0"))
        .and(header("x-channel", "stable"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let options = DownloadOptions::new()
        .with_user_agent("installer/2.0")
        .with_header("X-Channel", "stable");

    let result = manager()
        .download(
            &format!("{}/a.bin", server.uri()),
            &temp.path().join("a.bin"),
            Some(&options),
            None,
        )
        .await
        .unwrap();

    assert!(result.success);
}

#[tokio::test]
async fn test_progress_bytes_never_decrease() {
    let body = payload(200_000);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let recorder = Recorder::default();
    let options = DownloadOptions::new().with_buffer_size(4096);

    let result = manager()
        .download(
            &format!("{}/big.bin", server.uri()),
            &temp.path().join("big.bin"),
            Some(&options),
            Some(&recorder),
        )
        .await
        .unwrap();

    assert!(result.success);
    let downloading: Vec<u64> = recorder
        .events()
        .iter()
        .filter(|e| e.phase == Phase::Downloading)
        .map(|e| e.bytes_downloaded)
        .collect();
    assert!(downloading.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(recorder.max_bytes(), 200_000);
    assert_eq!(recorder.events().last().unwrap().total_bytes, Some(200_000));
}

// =============================================================================
// Integrity
// =============================================================================

#[tokio::test]
async fn test_md5_digest_match() {
    let content = b"Test content for checksum".to_vec();
    let expected = md5_hex(&content);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("file.txt");
    let options = DownloadOptions::new().with_expected_hash(&expected, HashAlgorithm::Md5);
    let recorder = Recorder::default();

    let result = manager()
        .download(&format!("{}/file.txt", server.uri()), &dest, Some(&options), Some(&recorder))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.hash_verified, Some(true));
    assert_eq!(result.actual_hash.as_deref(), Some(expected.as_str()));
    assert!(recorder.events().iter().any(|e| e.phase == Phase::Verifying));
}

#[tokio::test]
async fn test_algorithm_inferred_from_digest_length() {
    let content = payload(1000);
    let expected = sha256_hex(&content).to_uppercase();

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content.clone()))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let options = DownloadOptions {
        expected_hash: Some(expected),
        ..Default::default()
    };

    let result = manager()
        .download(
            &format!("{}/file.bin", server.uri()),
            &temp.path().join("file.bin"),
            Some(&options),
            None,
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.hash_verified, Some(true));
    assert_eq!(result.actual_hash, Some(sha256_hex(&content)));
}

#[tokio::test]
async fn test_digest_mismatch_fails_and_removes_destination() {
    let content = b"Test content for checksum".to_vec();
    let actual = md5_hex(&content);
    let bogus = "0".repeat(32);

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/file.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("file.txt");
    let options = DownloadOptions::new().with_expected_hash(&bogus, HashAlgorithm::Md5);
    let recorder = Recorder::default();

    let result = manager()
        .download(&format!("{}/file.txt", server.uri()), &dest, Some(&options), Some(&recorder))
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.outcome, DownloadOutcome::Failed);
    assert_eq!(result.hash_verified, Some(false));
    assert_eq!(result.actual_hash.as_deref(), Some(actual.as_str()));
    assert_ne!(result.actual_hash.as_deref(), Some(bogus.as_str()));
    assert!(matches!(result.error, Some(DownloadError::ChecksumMismatch { .. })));
    assert_eq!(result.bytes_downloaded, 25);
    assert!(!dest.exists());
    assert_eq!(recorder.events().last().unwrap().phase, Phase::Failed);
}

#[tokio::test]
async fn test_expected_hash_without_algorithm_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"Hello, World!".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("hello.txt");
    let options = DownloadOptions::new().with_expected_hash("0".repeat(32), HashAlgorithm::None);

    let error = manager()
        .download(&format!("{}/hello.txt", server.uri()), &dest, Some(&options), None)
        .await
        .unwrap_err();

    assert!(matches!(
        error,
        DownloadError::UnsupportedAlgorithm(HashAlgorithm::None)
    ));
    assert!(error.is_precondition());
    assert!(!dest.exists());
    assert!(!part_path(&dest).exists());
}

#[tokio::test]
async fn test_uninferable_digest_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"data".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let options = DownloadOptions {
        expected_hash: Some("abc123".to_string()),
        ..Default::default()
    };

    let result = manager()
        .download(
            &format!("{}/data.bin", server.uri()),
            &temp.path().join("data.bin"),
            Some(&options),
            None,
        )
        .await;

    assert!(matches!(result, Err(DownloadError::UnsupportedAlgorithm(_))));
}

#[tokio::test]
async fn test_verified_destination_skips_network() {
    let content = payload(4096);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("cached.bin");
    std::fs::write(&dest, &content).unwrap();
    let options = DownloadOptions::new().with_expected_hash(sha256_hex(&content), HashAlgorithm::Sha256);
    let recorder = Recorder::default();

    let result = manager()
        .download(&format!("{}/cached.bin", server.uri()), &dest, Some(&options), Some(&recorder))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.bytes_downloaded, 4096);
    assert_eq!(result.hash_verified, Some(true));
    assert_eq!(result.retry_attempts, 0);
    assert!(!part_path(&dest).exists());
    assert!(recorder.events().last().unwrap().is_complete);
}

// =============================================================================
// Retries and failures
// =============================================================================

#[tokio::test]
async fn test_retries_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.bin"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"finally".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("flaky.bin");
    let recorder = Recorder::default();

    let result = manager()
        .download(&format!("{}/flaky.bin", server.uri()), &dest, None, Some(&recorder))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.retry_attempts, 2);
    assert_eq!(std::fs::read(&dest).unwrap(), b"finally");

    let retries: Vec<u32> = recorder
        .events()
        .iter()
        .filter(|e| e.phase == Phase::Retrying)
        .map(|e| e.retry_attempt)
        .collect();
    assert_eq!(retries, vec![1, 2]);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/down.bin"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let options = DownloadOptions::new().with_max_retries(2);
    let recorder = Recorder::default();

    let result = manager()
        .download(
            &format!("{}/down.bin", server.uri()),
            &temp.path().join("down.bin"),
            Some(&options),
            Some(&recorder),
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.retry_attempts, 2);
    assert!(matches!(result.error, Some(DownloadError::Http { status: 503, .. })));
    assert!(result.error_message.unwrap().contains("503"));

    let last = recorder.events().pop().unwrap();
    assert_eq!(last.phase, Phase::Failed);
    assert!(last.error.is_some());
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.bin"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("missing.bin");

    let result = manager()
        .download(&format!("{}/missing.bin", server.uri()), &dest, None, None)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.retry_attempts, 0);
    assert!(matches!(result.error, Some(DownloadError::Http { status: 404, .. })));
    assert!(!dest.exists());
    assert!(!part_path(&dest).exists());
}

#[tokio::test]
async fn test_throttling_status_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/busy.bin"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/busy.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let result = manager()
        .download(
            &format!("{}/busy.bin", server.uri()),
            &temp.path().join("busy.bin"),
            None,
            None,
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.retry_attempts, 1);
}

#[tokio::test]
async fn test_timeout_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.bin"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"late".to_vec())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let options = DownloadOptions::new()
        .with_timeout(Duration::from_millis(100))
        .with_max_retries(1);

    let result = manager()
        .download(
            &format!("{}/slow.bin", server.uri()),
            &temp.path().join("slow.bin"),
            Some(&options),
            None,
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.retry_attempts, 1);
    assert!(matches!(result.error, Some(DownloadError::Timeout { .. })));
}

#[tokio::test]
async fn test_invalid_url_is_precondition_error() {
    let temp = TempDir::new().unwrap();
    let result = manager()
        .download("not-a-url", &temp.path().join("a.bin"), None, None)
        .await;

    let error = result.unwrap_err();
    assert!(error.is_precondition());
}

// =============================================================================
// Resume negotiation
// =============================================================================

#[tokio::test]
async fn test_resumes_from_partial_file() {
    let body = payload(1000);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resume.bin"))
        .and(header("range", "bytes=400-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 400-999/1000")
                .set_body_bytes(body[400..].to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("resume.bin");
    std::fs::write(part_path(&dest), &body[..400]).unwrap();
    let recorder = Recorder::default();

    let result = manager()
        .download(&format!("{}/resume.bin", server.uri()), &dest, None, Some(&recorder))
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.was_resumed);
    assert_eq!(result.bytes_downloaded, 1000);
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    let first_downloading = recorder
        .events()
        .into_iter()
        .find(|e| e.phase == Phase::Downloading)
        .unwrap();
    assert!(first_downloading.is_resuming);
    assert!(first_downloading.bytes_downloaded >= 400);
}

#[tokio::test]
async fn test_server_ignoring_range_rewrites_from_zero() {
    let body = payload(1000);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/norange.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("norange.bin");
    std::fs::write(part_path(&dest), vec![0xAA; 300]).unwrap();

    let result = manager()
        .download(&format!("{}/norange.bin", server.uri()), &dest, None, None)
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.was_resumed);
    assert_eq!(result.bytes_downloaded, 1000);
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].headers.get("range").unwrap(), "bytes=300-");
}

#[tokio::test]
async fn test_range_not_satisfiable_restarts_fresh() {
    let body = payload(500);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/changed.bin"))
        .and(header_exists("range"))
        .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */500"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/changed.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("changed.bin");
    std::fs::write(part_path(&dest), vec![0x55; 800]).unwrap();

    let result = manager()
        .download(&format!("{}/changed.bin", server.uri()), &dest, None, None)
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.was_resumed);
    assert_eq!(result.retry_attempts, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_range_not_satisfiable_with_complete_partial() {
    let body = payload(500);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/done.bin"))
        .and(header("range", "bytes=500-"))
        .respond_with(ResponseTemplate::new(416).insert_header("content-range", "bytes */500"))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("done.bin");
    std::fs::write(part_path(&dest), &body).unwrap();
    let options = DownloadOptions::new().with_expected_hash(md5_hex(&body), HashAlgorithm::Md5);

    let result = manager()
        .download(&format!("{}/done.bin", server.uri()), &dest, Some(&options), None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.hash_verified, Some(true));
    assert_eq!(result.bytes_downloaded, 500);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_wrong_offset_discards_partial_and_retries() {
    let body = payload(600);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/shifted.bin"))
        .and(header_exists("range"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", "bytes 0-599/600")
                .set_body_bytes(body.clone()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/shifted.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("shifted.bin");
    std::fs::write(part_path(&dest), &body[..200]).unwrap();

    let result = manager()
        .download(&format!("{}/shifted.bin", server.uri()), &dest, None, None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.retry_attempts, 1);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
}

#[tokio::test]
async fn test_stale_partial_is_not_resumed() {
    let body = payload(700);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/stale.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("stale.bin");
    let part = part_path(&dest);
    std::fs::write(&part, &body[..350]).unwrap();
    let two_days_ago = SystemTime::now() - Duration::from_secs(48 * 3600);
    filetime::set_file_mtime(&part, filetime::FileTime::from_system_time(two_days_ago)).unwrap();

    let result = manager()
        .download(&format!("{}/stale.bin", server.uri()), &dest, None, None)
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.was_resumed);
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("range").is_none());
}

#[tokio::test]
async fn test_resume_disabled_ignores_partial() {
    let body = payload(300);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fresh.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("fresh.bin");
    std::fs::write(part_path(&dest), vec![0xFF; 100]).unwrap();
    let options = DownloadOptions::new().with_allow_resume(false);

    let result = manager()
        .download(&format!("{}/fresh.bin", server.uri()), &dest, Some(&options), None)
        .await
        .unwrap();

    assert!(result.success);
    assert!(!result.was_resumed);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    let requests = server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("range").is_none());
}

// =============================================================================
// Interrupted transfers (raw TCP)
// =============================================================================

/// How the first connection misbehaves.
#[derive(Clone, Copy)]
enum FirstConnection {
    /// Send part of the body, then close the socket.
    CloseAfter(usize),
    /// Send part of the body, then stall.
    StallAfter(usize),
}

struct RangeServer {
    url: String,
    range_starts: Arc<Mutex<Vec<Option<u64>>>>,
}

/// Serve `body`, misbehaving on the first connection and honouring
/// `Range: bytes=N-` on later ones.
async fn spawn_range_server(body: Vec<u8>, first: FirstConnection) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let range_starts = Arc::new(Mutex::new(Vec::new()));
    let seen = range_starts.clone();

    tokio::spawn(async move {
        let mut connection = 0;
        while let Ok((mut stream, _)) = listener.accept().await {
            let request = read_request(&mut stream).await;
            let start = range_start(&request);
            seen.lock().unwrap().push(start);
            connection += 1;

            if connection == 1 {
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let (cut, stall) = match first {
                    FirstConnection::CloseAfter(n) => (n, false),
                    FirstConnection::StallAfter(n) => (n, true),
                };
                stream.write_all(head.as_bytes()).await.unwrap();
                stream.write_all(&body[..cut]).await.unwrap();
                stream.flush().await.unwrap();
                if stall {
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        drop(stream);
                    });
                } else {
                    let _ = stream.shutdown().await;
                }
                continue;
            }

            match start {
                Some(offset) if offset > 0 && (offset as usize) < body.len() => {
                    let offset = offset as usize;
                    let head = format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nConnection: close\r\n\r\n",
                        body.len() - offset,
                        offset,
                        body.len() - 1,
                        body.len()
                    );
                    stream.write_all(head.as_bytes()).await.unwrap();
                    stream.write_all(&body[offset..]).await.unwrap();
                }
                _ => {
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    stream.write_all(head.as_bytes()).await.unwrap();
                    stream.write_all(&body).await.unwrap();
                }
            }
            stream.flush().await.unwrap();
            let _ = stream.shutdown().await;
        }
    });

    RangeServer {
        url: format!("http://{}/artifact.bin", addr),
        range_starts,
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&request).into_owned()
}

fn range_start(request: &str) -> Option<u64> {
    request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("range") {
            return None;
        }
        value.trim().strip_prefix("bytes=")?.strip_suffix('-')?.parse().ok()
    })
}

#[tokio::test]
async fn test_interrupted_transfer_resumes_byte_identical() {
    let body = payload(64 * 1024);
    let server = spawn_range_server(body.clone(), FirstConnection::CloseAfter(20_000)).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("artifact.bin");
    let options = DownloadOptions::new().with_expected_hash(sha256_hex(&body), HashAlgorithm::Sha256);

    let result = manager()
        .download(&server.url, &dest, Some(&options), None)
        .await
        .unwrap();

    assert!(result.success, "download failed: {:?}", result.error_message);
    assert!(result.was_resumed);
    assert_eq!(result.retry_attempts, 1);
    assert_eq!(result.hash_verified, Some(true));
    assert_eq!(std::fs::read(&dest).unwrap(), body);

    let starts = server.range_starts.lock().unwrap().clone();
    assert_eq!(starts.len(), 2);
    assert_eq!(starts[0], None);
    assert!(matches!(starts[1], Some(offset) if offset > 0));
}

#[tokio::test]
async fn test_cancel_keeps_partial_for_later_resume() {
    let body = payload(64 * 1024);
    let cut = 16_384;
    let server = spawn_range_server(body.clone(), FirstConnection::StallAfter(cut)).await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("artifact.bin");
    let manager = manager();
    let recorder = Recorder::default();
    let cancel = CancellationToken::new();

    let download = manager.download_with_cancel(&server.url, &dest, None, Some(&recorder), &cancel);
    let watcher = async {
        for _ in 0..500 {
            if recorder.max_bytes() >= cut as u64 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(download, watcher);
    let result = result.unwrap();

    assert!(result.is_cancelled());
    assert!(!result.success);
    assert_eq!(result.outcome, DownloadOutcome::Cancelled);
    assert_eq!(recorder.events().last().unwrap().phase, Phase::Cancelled);
    assert!(!dest.exists());
    assert_eq!(std::fs::metadata(part_path(&dest)).unwrap().len(), cut as u64);
    assert_eq!(result.bytes_downloaded, cut as u64);

    // A later call picks up where the cancelled one stopped
    let result = manager.download(&server.url, &dest, None, None).await.unwrap();

    assert!(result.success);
    assert!(result.was_resumed);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert_eq!(
        server.range_starts.lock().unwrap().last().copied().flatten(),
        Some(cut as u64)
    );
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = test_config().with_backoff(Duration::from_secs(30), Duration::from_secs(30));
    let manager = DownloadManager::with_config(config).unwrap();
    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("a.bin");
    let cancel = CancellationToken::new();
    let recorder = Recorder::default();
    let url = format!("{}/a.bin", server.uri());

    let download = manager.download_with_cancel(
        &url,
        &dest,
        None,
        Some(&recorder),
        &cancel,
    );
    let canceller = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    };

    let started = std::time::Instant::now();
    let (result, ()) = tokio::join!(download, canceller);
    let result = result.unwrap();

    assert!(result.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.retry_attempts, 1);
    assert!(recorder.events().iter().any(|e| e.phase == Phase::Retrying));
}
