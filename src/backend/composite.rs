//! 요청 이름 형태에 따라 파일시스템/원격 fetch로 분기하는 백엔드

use std::net::SocketAddr;

use async_trait::async_trait;

use super::{Backend, ContentHandle, FilesystemBackend, HttpBackend};
use crate::config::BackendKind;
use crate::Result;

const URL_SCHEMES: [&str; 2] = ["http://", "https://"];

/// URL 요청인지 여부 (대소문자 구분)
pub fn is_url(name: &str) -> bool {
    URL_SCHEMES.iter().any(|scheme| name.starts_with(scheme))
}

pub struct CompositeBackend {
    fs: FilesystemBackend,
    http: HttpBackend,
}

impl CompositeBackend {
    pub fn new(fs: FilesystemBackend, http: HttpBackend) -> Self {
        Self { fs, http }
    }
}

#[async_trait]
impl Backend for CompositeBackend {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn sanitize(&self, requested: &str) -> Result<String> {
        // 디코딩해 봐야 누구 요청인지 알 수 있다
        let maybe_url = self.http.sanitize(requested)?;
        if is_url(&maybe_url) {
            return Ok(maybe_url);
        }

        // 파일시스템 쪽에는 디코딩 전 이름을 그대로 넘긴다
        self.fs.sanitize(requested)
    }

    async fn open(&self, resolved: &str, client: SocketAddr) -> Result<ContentHandle> {
        if is_url(resolved) {
            self.http.open(resolved, client).await
        } else {
            self.fs.open(resolved, client).await
        }
    }

    fn close(&self, handle: ContentHandle) {
        match handle.kind() {
            BackendKind::Http => self.http.close(handle),
            _ => self.fs.close(handle),
        }
    }
}
