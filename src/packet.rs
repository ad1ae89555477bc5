//! 패킷 코덱 (RFC 1350 + RFC 1782 옵션 확장)
//!
//! 모든 정수 필드는 빅엔디언이다.
//!
//! ```text
//! RRQ   | 00 01 | filename | 0 | mode | 0 | [optname | 0 | optval | 0]*
//! DATA  | 00 03 | block(2) | payload
//! ACK   | 00 04 | block(2)
//! ERROR | 00 05 | code(2)  | message | 0
//! OACK  | 00 06 | [optname | 0 | optval | 0]*
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// 패킷 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// 읽기 요청
    ReadRequest = 1,

    /// 쓰기 요청 (서버는 지원하지 않음)
    WriteRequest = 2,

    /// 데이터 블록
    Data = 3,

    /// 블록 확인
    Ack = 4,

    /// 에러
    Error = 5,

    /// 옵션 확인
    OptionAck = 6,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Opcode::ReadRequest),
            2 => Some(Opcode::WriteRequest),
            3 => Some(Opcode::Data),
            4 => Some(Opcode::Ack),
            5 => Some(Opcode::Error),
            6 => Some(Opcode::OptionAck),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// 에러 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    /// 알 수 없는 값은 `Undefined`로 취급
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Undefined => "undefined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full",
            ErrorCode::IllegalOperation => "illegal operation",
            ErrorCode::UnknownTransferId => "unknown transfer id",
            ErrorCode::FileExists => "file already exists",
            ErrorCode::NoSuchUser => "no such user",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

/// 읽기 요청
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub filename: String,
    pub mode: String,

    /// 클라이언트가 보낸 순서 그대로의 (이름, 값) 쌍
    pub options: Vec<(String, String)>,
}

impl ReadRequest {
    pub fn new(filename: impl Into<String>, mode: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mode: mode.into(),
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((name.into(), value.into()));
        self
    }

    /// 옵션 조회 (이름은 대소문자 구분 없음)
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 디코딩/인코딩 단위 패킷
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ReadRequest(ReadRequest),

    /// `block`은 1부터 시작. 인코딩 시 16비트를 넘으면 실패한다.
    Data { block: u64, payload: Bytes },

    Ack(u16),

    Error { code: ErrorCode, message: String },

    OptionAck(Vec<(String, String)>),

    /// 서버가 처리하지 않는 opcode (WRQ 포함)
    Unsupported(u16),
}

impl Packet {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Packet::Error {
            code,
            message: message.into(),
        }
    }

    /// 데이터그램 디코딩
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::MalformedPacket("Packet too short".into()));
        }

        let mut buf = bytes;
        let opcode = buf.get_u16();

        match Opcode::from_u16(opcode) {
            Some(Opcode::ReadRequest) => decode_read_request(buf).map(Packet::ReadRequest),
            Some(Opcode::Ack) => {
                if buf.len() != 2 {
                    return Err(Error::MalformedPacket(format!(
                        "ACK payload must be 2 bytes, got {}",
                        buf.len()
                    )));
                }
                Ok(Packet::Ack(buf.get_u16()))
            }
            Some(Opcode::Data) => {
                if buf.len() < 2 {
                    return Err(Error::MalformedPacket("DATA without block id".into()));
                }
                let block = buf.get_u16() as u64;
                Ok(Packet::Data {
                    block,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            Some(Opcode::Error) => {
                if buf.len() < 2 {
                    return Err(Error::MalformedPacket("ERROR without code".into()));
                }
                let code = ErrorCode::from_u16(buf.get_u16());
                let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
                let message = String::from_utf8_lossy(&buf[..end]).into_owned();
                Ok(Packet::Error { code, message })
            }
            Some(Opcode::OptionAck) => {
                let strings = split_strings(buf)?;
                if strings.len() % 2 != 0 {
                    return Err(Error::MalformedPacket("Malformed options".into()));
                }
                Ok(Packet::OptionAck(pair_up(strings)))
            }
            Some(Opcode::WriteRequest) | None => Ok(Packet::Unsupported(opcode)),
        }
    }

    /// 패킷 인코딩
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();

        match self {
            Packet::ReadRequest(req) => {
                buf.put_u16(Opcode::ReadRequest.as_u16());
                put_string(&mut buf, &req.filename);
                put_string(&mut buf, &req.mode);
                for (name, value) in &req.options {
                    put_string(&mut buf, name);
                    put_string(&mut buf, value);
                }
            }
            Packet::Data { block, payload } => {
                let wire_block = u16::try_from(*block).map_err(|_| Error::BlockOverflow {
                    block: *block,
                    block_size: payload.len(),
                })?;
                buf.reserve(4 + payload.len());
                buf.put_u16(Opcode::Data.as_u16());
                buf.put_u16(wire_block);
                buf.put_slice(payload);
            }
            Packet::Ack(block) => {
                buf.put_u16(Opcode::Ack.as_u16());
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(Opcode::Error.as_u16());
                buf.put_u16(code.as_u16());
                put_string(&mut buf, message);
            }
            Packet::OptionAck(options) => {
                buf.put_u16(Opcode::OptionAck.as_u16());
                for (name, value) in options {
                    put_string(&mut buf, name);
                    put_string(&mut buf, value);
                }
            }
            Packet::Unsupported(opcode) => {
                buf.put_u16(*opcode);
            }
        }

        Ok(buf.freeze())
    }
}

fn decode_read_request(buf: &[u8]) -> Result<ReadRequest> {
    let mut strings = split_strings(buf)?;

    if strings.len() < 2 {
        return Err(Error::MalformedPacket("Filename and mode required".into()));
    }

    let options = strings.split_off(2);
    if options.len() % 2 != 0 {
        return Err(Error::MalformedPacket("Malformed options".into()));
    }

    let mut head = strings.into_iter();
    let filename = head.next().unwrap_or_default();
    let mode = head.next().unwrap_or_default();

    Ok(ReadRequest {
        filename,
        mode,
        options: pair_up(options),
    })
}

/// NUL로 끝나는 문자열 목록 분리. 버퍼는 반드시 NUL로 끝나야 한다.
fn split_strings(buf: &[u8]) -> Result<Vec<String>> {
    if buf.is_empty() {
        return Ok(Vec::new());
    }
    if buf.last() != Some(&0) {
        return Err(Error::MalformedPacket(
            "Final argument should end with a \\0".into(),
        ));
    }

    buf[..buf.len() - 1]
        .split(|&b| b == 0)
        .map(|part| {
            String::from_utf8(part.to_vec())
                .map_err(|_| Error::MalformedPacket("Strings must be valid UTF-8".into()))
        })
        .collect()
}

fn pair_up(strings: Vec<String>) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(strings.len() / 2);
    let mut iter = strings.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((name, value));
    }
    pairs
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}
