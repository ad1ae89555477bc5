//! # tftproxy
//!
//! 읽기 전용 TFTP 서버 (RFC1350 + RFC1782 blksize 옵션)
//!
//! ## 핵심 특징
//! - **읽기 전용**: RRQ만 처리, octet 모드만 지원
//! - **플러그형 백엔드**: 파일시스템, 원격 HTTP fetch, 이름 형태에 따른 자동 분기
//! - **경로 격리**: 루트 밖을 가리키는 요청은 I/O 전에 거부
//! - **fetch 제한**: 화이트리스트, 크기/시간 제한, 리다이렉트 거부
//! - **클라이언트 주도 재전송**: 중복 ACK에 현재 블록 재전송
//! - **유휴 정리**: 일정 시간 트래픽이 없으면 남은 세션 일괄 해제

pub mod backend;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod packet;
pub mod server;
pub mod session;
pub mod stats;

pub use backend::{Backend, CompositeBackend, ContentHandle, FilesystemBackend, HttpBackend};
pub use client::Client;
pub use config::{BackendKind, Config, HttpConfig};
pub use engine::Engine;
pub use error::{Error, Result};
pub use packet::{ErrorCode, Opcode, Packet, ReadRequest};
pub use server::{Server, ShutdownHandle};
pub use session::{Session, SessionTable};
pub use stats::{ServerStats, StatsSnapshot};

/// 기본 TFTP 포트
pub const DEFAULT_PORT: u16 = 69;

/// 기본 블록 크기 (바이트)
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// 협상 가능한 최소 블록 크기
pub const MIN_BLOCK_SIZE: usize = 1;

/// 협상 가능한 최대 블록 크기 (RFC2348 상한)
pub const MAX_BLOCK_SIZE: usize = 65464;
