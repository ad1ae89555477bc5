//! 에러 타입 정의
//!
//! 백엔드/코덱에서 발생한 모든 실패는 이 타입으로 모이고,
//! 프로토콜 엔진 경계에서 [`ErrorCode`]로 변환되어 클라이언트에 전달된다.

use thiserror::Error;

use crate::packet::ErrorCode;

/// tftproxy 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 잘못된 패킷 (디코딩 실패)
    #[error("{0}")]
    MalformedPacket(String),

    #[error("Opcode {0} not handled by the server")]
    UnsupportedOpcode(u16),

    #[error("Only octet mode is supported by the server (got {mode})")]
    UnsupportedMode { mode: String },

    #[error("Bad option value: {name}={value}")]
    InvalidOption { name: String, value: String },

    /// 루트 밖 경로, 화이트리스트 거부 등
    #[error("{0}")]
    Security(String),

    #[error("{0}")]
    NotFound(String),

    /// OS 권한 거부, HTTP 비정상 응답, 크기/시간 제한 초과
    #[error("{0}")]
    PermissionDenied(String),

    #[error("block id overflow: block {block} with block size {block_size}")]
    BlockOverflow { block: u64, block_size: usize },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// 상대방이 보낸 에러 패킷 (클라이언트 측)
    #[error("remote error {code}: {message}")]
    Remote { code: ErrorCode, message: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 클라이언트에 보낼 에러 코드
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Error::MalformedPacket(_)
            | Error::UnsupportedOpcode(_)
            | Error::UnsupportedMode { .. }
            | Error::InvalidOption { .. } => ErrorCode::IllegalOperation,
            Error::Security(_) | Error::PermissionDenied(_) => ErrorCode::AccessViolation,
            Error::NotFound(_) => ErrorCode::FileNotFound,
            Error::Remote { code, .. } => *code,
            Error::BlockOverflow { .. }
            | Error::Io(_)
            | Error::Http(_)
            | Error::Timeout(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorCode::Undefined,
        }
    }

    /// 예상하지 못한 실패인지 여부 (상세 내용은 서버 로그에만 남긴다)
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Http(_) | Error::Config(_) | Error::Internal(_)
        )
    }

    /// 에러 패킷에 실릴 메시지
    pub fn client_message(&self) -> String {
        match self {
            Error::BlockOverflow { .. } => "File too large for this block size".to_string(),
            e if e.is_internal() => "Internal error".to_string(),
            e => e.to_string(),
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_taxonomy() {
        assert_eq!(
            Error::MalformedPacket("x".into()).error_code(),
            ErrorCode::IllegalOperation
        );
        assert_eq!(
            Error::UnsupportedMode { mode: "netascii".into() }.error_code(),
            ErrorCode::IllegalOperation
        );
        assert_eq!(
            Error::UnsupportedOpcode(2).error_code(),
            ErrorCode::IllegalOperation
        );
        assert_eq!(
            Error::Security("traversal".into()).error_code(),
            ErrorCode::AccessViolation
        );
        assert_eq!(
            Error::NotFound("gone".into()).error_code(),
            ErrorCode::FileNotFound
        );
        assert_eq!(
            Error::BlockOverflow { block: 65536, block_size: 512 }.error_code(),
            ErrorCode::Undefined
        );
    }

    #[test]
    fn test_internal_detail_is_hidden() {
        let err = Error::Internal("db password is hunter2".into());
        assert_eq!(err.error_code(), ErrorCode::Undefined);
        assert_eq!(err.client_message(), "Internal error");

        let io = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"));
        assert_eq!(io.client_message(), "Internal error");

        let denied = Error::PermissionDenied("GET x returned HTTP/404".into());
        assert_eq!(denied.client_message(), "GET x returned HTTP/404");
    }
}
