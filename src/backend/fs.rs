//! 파일시스템 백엔드
//!
//! 모든 요청을 루트 디렉터리 안으로 가둔다.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;

use super::{Backend, ContentHandle};
use crate::config::BackendKind;
use crate::{Error, Result};

/// 루트 디렉터리 기반 백엔드
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    /// 절대 경로로 정규화된 루트
    root: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()?.join(root)
        };

        Ok(Self {
            root: normalize(&absolute),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 에러 메시지용 루트 기준 상대 경로
    fn display_name<'a>(&self, path: &'a Path) -> std::path::Display<'a> {
        path.strip_prefix(&self.root).unwrap_or(path).display()
    }
}

/// `..`, `.`을 어휘적으로 정리 (심볼릭 링크는 따라가지 않는다)
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[async_trait]
impl Backend for FilesystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn sanitize(&self, requested: &str) -> Result<String> {
        let resolved = normalize(&self.root.join(requested));

        // 컴포넌트 단위 비교라 "/srv/tftp"가 "/srv/tftpx"를 허용하지 않는다
        if !resolved.starts_with(&self.root) {
            return Err(Error::Security("Directory traversal prevented".into()));
        }

        Ok(resolved.to_string_lossy().into_owned())
    }

    async fn open(&self, resolved: &str, _client: SocketAddr) -> Result<ContentHandle> {
        let path = Path::new(resolved);

        let file = File::open(path).await.map_err(|e| {
            let msg = format!("{} ({})", e, self.display_name(path));
            match e.kind() {
                ErrorKind::NotFound => Error::NotFound(msg),
                _ => Error::PermissionDenied(msg),
            }
        })?;

        let metadata = file.metadata().await.map_err(|e| {
            Error::PermissionDenied(format!("{} ({})", e, self.display_name(path)))
        })?;
        if metadata.is_dir() {
            return Err(Error::PermissionDenied(format!(
                "Is a directory ({})",
                self.display_name(path)
            )));
        }

        Ok(ContentHandle::new(file, BackendKind::Filesystem).with_path(path))
    }
}
