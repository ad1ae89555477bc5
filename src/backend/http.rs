//! 원격 fetch 백엔드
//!
//! HTTP 클라이언트가 없는 부트로더(u-boot 등)를 위해 URL을 대신 받아서
//! 캐시 파일로 제공한다. 클라이언트는 URL을 퍼센트 인코딩해서 요청해야 한다.
//!
//! DoS 방지를 위한 제한:
//! - 화이트리스트에 없는 URL은 네트워크 요청 없이 거부
//! - 리다이렉트 거부 (설정으로 허용 가능)
//! - 전체 다운로드 시간 제한 (하드 데드라인)
//! - 최대 다운로드 크기 제한
//!
//! 실패한 다운로드의 부분 파일은 조사용으로 캐시 디렉터리에 남긴다.

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use regex::Regex;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{error, info};

use super::{Backend, ContentHandle};
use crate::config::{BackendKind, HttpConfig};
use crate::{Error, Result};

/// 캐시 파일 이름에 들어가는 인코딩된 URL 최대 길이
const MAX_ENCODED_URL_LEN: usize = 160;

/// 진행 중인 HTTP 응답
#[async_trait]
pub trait Download: Send {
    /// HTTP 상태 코드
    fn status(&self) -> u16;

    /// 다음 본문 청크. 끝이면 `None`.
    async fn chunk(&mut self) -> Result<Option<Bytes>>;
}

/// HTTP GET 전송 계층
///
/// 네트워크/프로토콜 실패는 `Error::PermissionDenied`로 보고해야 한다.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<Box<dyn Download>>;
}

/// reqwest 기반 전송 계층
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(allow_redirects: bool) -> Result<Self> {
        let policy = if allow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder().redirect(policy).build()?;
        Ok(Self { client })
    }
}

struct ReqwestDownload(reqwest::Response);

#[async_trait]
impl Download for ReqwestDownload {
    fn status(&self) -> u16 {
        self.0.status().as_u16()
    }

    async fn chunk(&mut self) -> Result<Option<Bytes>> {
        self.0
            .chunk()
            .await
            .map_err(|e| Error::PermissionDenied(format!("download interrupted: {}", e)))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<Box<dyn Download>> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::PermissionDenied(format!("GET {} failed: {}", url, e)))?;

        Ok(Box::new(ReqwestDownload(response)))
    }
}

/// 원격 fetch 백엔드
pub struct HttpBackend {
    config: HttpConfig,
    whitelist: Vec<Regex>,
    transport: Arc<dyn Transport>,
}

impl HttpBackend {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.allow_redirects)?);
        Self::with_transport(config, transport)
    }

    /// 전송 계층 지정 (테스트용 mock 등)
    pub fn with_transport(config: HttpConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        // 패턴은 URL 앞부분부터 매칭
        let whitelist = config
            .whitelist
            .iter()
            .map(|pattern| {
                Regex::new(&format!("^(?:{})", pattern))
                    .map_err(|e| Error::Config(format!("bad whitelist pattern {}: {}", pattern, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            whitelist,
            transport,
        })
    }

    pub fn is_whitelisted(&self, url: &str) -> bool {
        self.whitelist.iter().any(|re| re.is_match(url))
    }

    /// URL, 클라이언트, 시각으로 캐시 파일 경로 생성
    ///
    /// 같은 URL을 동시에/반복해서 받아도 충돌하지 않는다.
    pub fn cache_path(&self, url: &str, client: SocketAddr) -> PathBuf {
        let mut encoded = URL_SAFE_NO_PAD.encode(url);
        encoded.truncate(MAX_ENCODED_URL_LEN);

        let name = format!(
            "{}_{}_{}_{}",
            encoded,
            client.ip(),
            client.port(),
            chrono::Local::now().format("%Y-%m-%d_%H-%M-%S%.6f"),
        );
        self.config.cache_dir.join(name)
    }

    /// 본문을 `file`에 스트리밍. 받은 바이트 수 반환.
    async fn download(&self, url: &str, file: &mut File) -> Result<u64> {
        let timeout = self.config.timeout();
        let start = Instant::now();

        let mut response = self.transport.get(url, timeout).await?;

        let status = response.status();
        if (300..400).contains(&status) {
            return Err(Error::PermissionDenied(
                "Redirections are forbidden. Download aborted.".into(),
            ));
        }
        if !(200..300).contains(&status) {
            return Err(Error::PermissionDenied(format!(
                "GET {} returned HTTP/{}",
                url, status
            )));
        }

        let mut size = 0u64;
        while let Some(data) = response.chunk().await? {
            size += data.len() as u64;
            if size > self.config.max_size {
                return Err(Error::PermissionDenied(format!(
                    "Failed to download {}. More than {} bytes.",
                    url, self.config.max_size
                )));
            }

            file.write_all(&data).await?;

            if start.elapsed() > timeout {
                return Err(timeout_error(url, timeout));
            }
        }

        file.flush().await?;
        Ok(size)
    }
}

fn timeout_error(url: &str, timeout: Duration) -> Error {
    Error::PermissionDenied(format!(
        "{} took more than {:?} to download. Abort.",
        url, timeout
    ))
}

fn log_partial_download(url: &str, path: &Path, err: &Error) {
    error!(
        "Error while downloading {}: {}. Downloaded content has been stored to {}",
        url,
        err,
        path.display()
    );
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn sanitize(&self, requested: &str) -> Result<String> {
        Ok(percent_decode_str(requested).decode_utf8_lossy().into_owned())
    }

    async fn open(&self, url: &str, client: SocketAddr) -> Result<ContentHandle> {
        info!(client = %client, "Downloading {}", url);

        if !self.is_whitelisted(url) {
            return Err(Error::PermissionDenied(
                "Forbidden domain (not whitelisted)".into(),
            ));
        }

        fs::create_dir_all(&self.config.cache_dir).await?;

        let path = self.cache_path(url, client);
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;

        // 라이브러리 타임아웃과 별개로 전체 다운로드에 하드 데드라인 적용
        let timeout = self.config.timeout();
        let size = match tokio::time::timeout(timeout, self.download(url, &mut file)).await {
            Ok(Ok(size)) => size,
            Ok(Err(e)) => {
                log_partial_download(url, &path, &e);
                return Err(e);
            }
            Err(_) => {
                let e = timeout_error(url, timeout);
                log_partial_download(url, &path, &e);
                return Err(e);
            }
        };

        file.seek(SeekFrom::Start(0)).await?;

        info!(
            client = %client,
            "{} successfully downloaded to {} ({} bytes)",
            url,
            path.display(),
            size
        );

        Ok(ContentHandle::new(file, BackendKind::Http).with_path(path))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 고정 응답을 돌려주는 mock 전송 계층
    pub(crate) struct MockTransport {
        status: u16,
        body: Vec<Bytes>,
        chunk_delay: Duration,
        pub calls: AtomicUsize,
    }

    impl MockTransport {
        pub(crate) fn ok(body: &[u8]) -> Self {
            Self::with_status(200, body)
        }

        pub(crate) fn with_status(status: u16, body: &[u8]) -> Self {
            Self {
                status,
                body: body.chunks(64).map(Bytes::copy_from_slice).collect(),
                chunk_delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn slow(mut self, delay: Duration) -> Self {
            self.chunk_delay = delay;
            self
        }
    }

    struct MockDownload {
        status: u16,
        body: VecDeque<Bytes>,
        delay: Duration,
    }

    #[async_trait]
    impl Download for MockDownload {
        fn status(&self) -> u16 {
            self.status
        }

        async fn chunk(&mut self) -> Result<Option<Bytes>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.body.pop_front())
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn get(&self, _url: &str, _timeout: Duration) -> Result<Box<dyn Download>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockDownload {
                status: self.status,
                body: self.body.iter().cloned().collect(),
                delay: self.chunk_delay,
            }))
        }
    }

    fn client() -> SocketAddr {
        "10.0.0.7:3456".parse().unwrap()
    }

    fn backend(cache_dir: &Path, transport: Arc<MockTransport>) -> HttpBackend {
        let config = HttpConfig {
            cache_dir: cache_dir.to_path_buf(),
            whitelist: vec!["http://www\\.download\\.tld".into()],
            max_size: 1000,
            ..HttpConfig::default()
        };
        HttpBackend::with_transport(config, transport).unwrap()
    }

    fn cache_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_sanitize_decodes_url() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(MockTransport::ok(b"")));

        assert_eq!(
            backend
                .sanitize("http%3A%2F%2Fwww.download.tld%2Fboot%20file")
                .unwrap(),
            "http://www.download.tld/boot file"
        );
        assert_eq!(backend.sanitize("plain.txt").unwrap(), "plain.txt");
    }

    #[test]
    fn test_whitelist_is_anchored() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(MockTransport::ok(b"")));

        assert!(backend.is_whitelisted("http://www.download.tld/superfile"));
        assert!(!backend.is_whitelisted("http://www.forbidden.com/superfile"));
        assert!(!backend.is_whitelisted("http://evil.com/?http://www.download.tld"));
    }

    #[test]
    fn test_cache_path_is_unique_per_client() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(MockTransport::ok(b"")));
        let url = "http://www.download.tld/a/b?c=d";

        let a = backend.cache_path(url, client());
        let b = backend.cache_path(url, "10.0.0.8:3456".parse().unwrap());

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir.path()));
        let name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&URL_SAFE_NO_PAD.encode(url)));
        assert!(name.contains("_10.0.0.7_3456_"));
    }

    #[tokio::test]
    async fn test_download_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::ok(b"small file"));
        let backend = backend(dir.path(), transport.clone());

        let url = backend.sanitize("http://www.download.tld/superfile").unwrap();
        let mut handle = backend.open(&url, client()).await.unwrap();

        assert_eq!(handle.kind(), BackendKind::Http);
        assert_eq!(handle.read_block(0, 512).await.unwrap().as_ref(), b"small file");

        let path = handle.path().unwrap().to_path_buf();
        backend.close(handle);

        // 캐시 파일은 close 후에도 남는다
        assert_eq!(std::fs::read(&path).unwrap(), b"small file");
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_whitelist_rejects_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::ok(b"never fetched"));
        let backend = backend(dir.path(), transport.clone());

        let result = backend
            .open("http://www.forbidden.com/superfile", client())
            .await;

        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(
            dir.path(),
            Arc::new(MockTransport::with_status(404, b"404 error")),
        );

        match backend.open("http://www.download.tld/superfile", client()).await {
            Err(Error::PermissionDenied(msg)) => assert!(msg.contains("404")),
            other => panic!("expected PermissionDenied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_redirect_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(MockTransport::with_status(302, b"")));

        assert!(matches!(
            backend.open("http://www.download.tld/moved", client()).await,
            Err(Error::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_max_size_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path(), Arc::new(MockTransport::ok(&[b'x'; 2000])));

        assert!(matches!(
            backend.open("http://www.download.tld/superfile", client()).await,
            Err(Error::PermissionDenied(_))
        ));

        // 부분 파일은 조사용으로 남는다
        assert_eq!(cache_entries(dir.path()), 1);
        let entry = std::fs::read_dir(dir.path()).unwrap().next().unwrap().unwrap();
        let partial = std::fs::read(entry.path()).unwrap();
        assert!(!partial.is_empty());
        assert!(partial.len() as u64 <= 1000);
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockTransport::ok(&[b'y'; 512]).slow(Duration::from_millis(20));
        let config = HttpConfig {
            cache_dir: dir.path().to_path_buf(),
            timeout_ms: 30,
            ..HttpConfig::default()
        };
        let backend = HttpBackend::with_transport(config, Arc::new(transport)).unwrap();

        match backend.open("http://www.download.tld/superfile", client()).await {
            Err(Error::PermissionDenied(msg)) => assert!(msg.contains("took more than")),
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}
