//! 콘텐츠 백엔드
//!
//! 요청된 이름을 읽을 수 있는 바이트 소스로 바꾸는 경계.
//! 프로토콜 엔진은 이 트레이트만 알고, 파일시스템인지 원격 fetch인지는 모른다.
//!
//! 호출 순서는 항상 `sanitize` → `open` → (전송) → `close`이다.

pub mod composite;
pub mod fs;
pub mod http;

use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::debug;

use crate::config::BackendKind;
use crate::{Config, Result};

pub use composite::CompositeBackend;
pub use fs::FilesystemBackend;
pub use http::{Download, HttpBackend, ReqwestTransport, Transport};

/// 세션이 읽어 갈 수 있는 바이트 소스
pub trait ContentSource: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> ContentSource for T {}

/// 백엔드가 연 콘텐츠 핸들
///
/// 세션이 단독 소유하고, 세션 종료 시 정확히 한 번 `Backend::close`로 반환된다.
pub struct ContentHandle {
    source: Box<dyn ContentSource>,

    /// 핸들을 만든 백엔드 종류 (composite가 close를 분배할 때 사용)
    kind: BackendKind,

    /// 로컬 파일 경로 (있는 경우, 로그용)
    path: Option<PathBuf>,
}

impl ContentHandle {
    pub fn new(source: impl ContentSource + 'static, kind: BackendKind) -> Self {
        Self {
            source: Box::new(source),
            kind,
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `offset`부터 최대 `len` 바이트 읽기
    ///
    /// 반환 길이가 `len`보다 짧으면 끝에 도달한 것이다.
    pub async fn read_block(&mut self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        self.source.seek(SeekFrom::Start(offset)).await?;

        let mut buf = BytesMut::with_capacity(len);
        let mut reader = (&mut *self.source).take(len as u64);
        while reader.read_buf(&mut buf).await? > 0 {}

        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for ContentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHandle")
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish()
    }
}

/// 콘텐츠 백엔드
#[async_trait]
pub trait Backend: Send + Sync {
    /// 로그용 이름
    fn name(&self) -> &'static str;

    /// I/O 전에 클라이언트가 보낸 이름을 검증/정규화
    ///
    /// 허용 범위 밖을 가리키는 이름은 `Error::Security`로 거부해야 한다.
    fn sanitize(&self, requested: &str) -> Result<String>;

    /// `sanitize`를 통과한 이름을 연다
    ///
    /// 실패는 `NotFound`, `PermissionDenied`, 그 외(내부 에러)로 구분된다.
    async fn open(&self, resolved: &str, client: SocketAddr) -> Result<ContentHandle>;

    /// 핸들 반환. 실패하지 않는다.
    fn close(&self, handle: ContentHandle) {
        debug!(backend = self.name(), path = ?handle.path(), "content closed");
        drop(handle);
    }
}

/// 설정에 맞는 백엔드 생성
pub fn from_config(config: &Config) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Filesystem => Arc::new(FilesystemBackend::new(&config.root)?),
        BackendKind::Http => Arc::new(HttpBackend::new(config.http.clone())?),
        BackendKind::Composite => Arc::new(CompositeBackend::new(
            FilesystemBackend::new(&config.root)?,
            HttpBackend::new(config.http.clone())?,
        )),
    };
    Ok(backend)
}
