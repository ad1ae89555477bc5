//! 클라이언트별 전송 세션과 세션 테이블
//!
//! 세션 테이블은 `DashMap`으로 샤딩되어 서로 다른 클라이언트끼리 경합하지 않고,
//! 각 세션은 비동기 뮤텍스로 감싸 같은 클라이언트의 처리를 직렬화한다.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::backend::{Backend, ContentHandle};
use crate::{Error, Result, DEFAULT_BLOCK_SIZE};

/// 테이블에 들어가는 공유 세션
pub type SharedSession = Arc<Mutex<Session>>;

/// 한 클라이언트의 읽기 전송 상태
pub struct Session {
    /// 세션 소유 클라이언트 (변경 불가)
    client: SocketAddr,

    /// 클라이언트가 보낸 이름 그대로
    requested_name: String,

    /// 백엔드가 해석한 이름
    resolved_name: String,

    /// 콘텐츠 핸들 (release 시 `None`)
    content: Option<ContentHandle>,

    /// 핸들을 연 백엔드
    backend: Arc<dyn Backend>,

    /// 마지막으로 확인(ACK)된 블록 번호. 0부터 시작.
    pub block_id: u64,

    /// 블록 크기 (협상 후 고정)
    pub block_size: usize,

    /// 마지막 읽기가 block_size보다 짧았는지 (마지막 블록 생성됨)
    pub at_eof: bool,

    /// 지금까지 보낸 가장 큰 블록 번호 (재전송 판별용)
    last_sent: u64,
}

impl Session {
    pub fn new(
        client: SocketAddr,
        requested_name: impl Into<String>,
        resolved_name: impl Into<String>,
        content: ContentHandle,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            client,
            requested_name: requested_name.into(),
            resolved_name: resolved_name.into(),
            content: Some(content),
            backend,
            block_id: 0,
            block_size: DEFAULT_BLOCK_SIZE,
            at_eof: false,
            last_sent: 0,
        }
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn requested_name(&self) -> &str {
        &self.requested_name
    }

    pub fn is_released(&self) -> bool {
        self.content.is_none()
    }

    /// 다음에 보낼 블록 번호
    pub fn next_block(&self) -> u64 {
        self.block_id + 1
    }

    /// `block_id * block_size` 위치에서 한 블록 읽기
    ///
    /// 읽은 길이가 `block_size`보다 짧으면 `at_eof`가 켜진다.
    /// 반환값의 두 번째 요소는 이미 한 번 보낸 블록인지 여부.
    pub async fn read_next_block(&mut self) -> Result<(Bytes, bool)> {
        let offset = self.block_id * self.block_size as u64;
        let block_size = self.block_size;

        let content = self
            .content
            .as_mut()
            .ok_or_else(|| Error::Internal("read from a released session".into()))?;
        let data = content.read_block(offset, block_size).await?;

        self.at_eof = data.len() < block_size;

        let block = self.next_block();
        let retransmit = block <= self.last_sent;
        self.last_sent = self.last_sent.max(block);

        Ok((data, retransmit))
    }

    /// 콘텐츠 핸들 반환. 여러 번 불러도 백엔드 close는 한 번만 호출된다.
    pub fn release(&mut self) {
        if let Some(content) = self.content.take() {
            debug!(
                client = %self.client,
                "Releasing session for {} -> {} (block {})",
                self.requested_name,
                self.resolved_name,
                self.block_id
            );
            self.backend.close(content);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client", &self.client)
            .field("requested_name", &self.requested_name)
            .field("block_id", &self.block_id)
            .field("block_size", &self.block_size)
            .field("at_eof", &self.at_eof)
            .finish()
    }
}

/// 클라이언트 주소 → 세션
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<SocketAddr, SharedSession>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client: &SocketAddr) -> Option<SharedSession> {
        self.sessions.get(client).map(|entry| entry.value().clone())
    }

    /// 세션 등록. 같은 클라이언트의 기존 세션은 대체되어 해제된다.
    pub fn insert(&self, session: Session) -> SharedSession {
        let client = session.client();
        let shared = Arc::new(Mutex::new(session));
        if self.sessions.insert(client, shared.clone()).is_some() {
            debug!(client = %client, "Previous session superseded by a new request");
        }
        shared
    }

    /// 클라이언트의 세션 제거
    pub fn remove(&self, client: &SocketAddr) -> bool {
        self.sessions.remove(client).is_some()
    }

    /// `session`이 아직 해당 클라이언트의 현재 세션일 때만 제거
    ///
    /// 처리 도중 새 요청이 들어와 세션이 바뀐 경우 새 세션을 지우지 않는다.
    pub fn remove_session(&self, client: &SocketAddr, session: &SharedSession) -> bool {
        self.sessions
            .remove_if(client, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    /// 모든 세션 제거. 제거된 세션 수 반환.
    ///
    /// 사용 중인 세션은 마지막 참조가 사라질 때 해제된다.
    pub fn clear(&self) -> usize {
        let clients: Vec<SocketAddr> = self.sessions.iter().map(|e| *e.key()).collect();
        clients
            .iter()
            .filter(|client| self.sessions.remove(client).is_some())
            .count()
    }

    pub fn contains(&self, client: &SocketAddr) -> bool {
        self.sessions.contains_key(client)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::BackendKind;
    use async_trait::async_trait;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 메모리 콘텐츠를 제공하고 close 횟수를 세는 백엔드
    #[derive(Default)]
    pub(crate) struct MemoryBackend {
        pub data: Vec<u8>,
        pub closed: AtomicUsize,
    }

    impl MemoryBackend {
        pub(crate) fn new(data: &[u8]) -> Self {
            Self {
                data: data.to_vec(),
                closed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Backend for MemoryBackend {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn sanitize(&self, requested: &str) -> Result<String> {
            Ok(requested.to_string())
        }

        async fn open(&self, _resolved: &str, _client: SocketAddr) -> Result<ContentHandle> {
            Ok(ContentHandle::new(
                Cursor::new(self.data.clone()),
                BackendKind::Filesystem,
            ))
        }

        fn close(&self, handle: ContentHandle) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            drop(handle);
        }
    }

    fn client(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn session(backend: &Arc<MemoryBackend>, port: u16) -> Session {
        let content = backend.open("f", client(port)).await.unwrap();
        Session::new(client(port), "f", "f", content, backend.clone())
    }

    #[tokio::test]
    async fn test_read_blocks_until_eof() {
        let backend = Arc::new(MemoryBackend::new(&[7u8; 1056]));
        let mut s = session(&backend, 1).await;

        let (first, retransmit) = s.read_next_block().await.unwrap();
        assert_eq!(first.len(), 512);
        assert!(!retransmit);
        assert!(!s.at_eof);

        // 같은 block_id로 다시 읽으면 재전송
        let (again, retransmit) = s.read_next_block().await.unwrap();
        assert_eq!(again, first);
        assert!(retransmit);

        s.block_id = 2;
        let (last, _) = s.read_next_block().await.unwrap();
        assert_eq!(last.len(), 32);
        assert!(s.at_eof);
    }

    #[tokio::test]
    async fn test_exactly_aligned_file_ends_with_empty_block() {
        let backend = Arc::new(MemoryBackend::new(&[1u8; 1024]));
        let mut s = session(&backend, 1).await;

        s.block_id = 1;
        let (second, _) = s.read_next_block().await.unwrap();
        assert_eq!(second.len(), 512);
        assert!(!s.at_eof);

        s.block_id = 2;
        let (third, _) = s.read_next_block().await.unwrap();
        assert!(third.is_empty());
        assert!(s.at_eof);
    }

    #[tokio::test]
    async fn test_release_closes_once() {
        let backend = Arc::new(MemoryBackend::new(b"abc"));
        let mut s = session(&backend, 1).await;

        s.release();
        s.release();
        assert!(s.is_released());
        drop(s);

        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_table_supersede_and_clear() {
        let backend = Arc::new(MemoryBackend::new(b"abc"));
        let table = SessionTable::new();

        table.insert(session(&backend, 1).await);
        table.insert(session(&backend, 2).await);
        assert_eq!(table.len(), 2);

        // 같은 클라이언트의 새 요청은 기존 세션을 대체
        table.insert(session(&backend, 1).await);
        assert_eq!(table.len(), 2);
        assert_eq!(backend.closed.load(Ordering::SeqCst), 1);

        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
        assert_eq!(backend.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_remove_session_ignores_newer_session() {
        let backend = Arc::new(MemoryBackend::new(b"abc"));
        let table = SessionTable::new();

        let old = table.insert(session(&backend, 1).await);
        let new = table.insert(session(&backend, 1).await);

        assert!(!table.remove_session(&client(1), &old));
        assert!(table.contains(&client(1)));
        assert!(table.remove_session(&client(1), &new));
        assert!(!table.contains(&client(1)));
    }
}
