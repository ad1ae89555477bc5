//! 프로토콜 엔진
//!
//! 디코딩된 패킷을 해석해 세션 상태를 바꾸고 응답 패킷을 만든다.
//! 소켓을 직접 다루지 않으므로 데이터그램 단위로 테스트할 수 있다.
//!
//! 상태 전이:
//!
//! ```text
//! Idle --RRQ--> Active --ACK(마지막 블록)--> Completed --> Idle
//!                 |  ^
//!                 |  +--ACK(다음/중복)--> DATA
//!                 +--에러--> Failed --> Idle
//!                 +--유휴 타임아웃--> Reaped --> Idle
//! ```
//!
//! 재전송은 전적으로 클라이언트 주도: 기대한 다음 블록이 아닌 ACK가 오면
//! 현재 블록을 그대로 다시 보낸다.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::packet::{Packet, ReadRequest};
use crate::session::{Session, SessionTable};
use crate::stats::ServerStats;
use crate::{Error, Result, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// 지원하는 유일한 전송 모드
const OCTET_MODE: &str = "octet";

/// 블록 크기 옵션 이름
const BLKSIZE_OPTION: &str = "blksize";

/// 프로토콜 엔진
pub struct Engine {
    backend: Arc<dyn Backend>,
    sessions: SessionTable,
    stats: ServerStats,

    /// 클라이언트별 처리 순서 게이트
    endpoints: DashMap<SocketAddr, Arc<Mutex<()>>>,
}

impl Engine {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            sessions: SessionTable::new(),
            stats: ServerStats::new(),
            endpoints: DashMap::new(),
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// 데이터그램 하나 처리. 보낼 응답이 있으면 인코딩된 바이트 반환.
    ///
    /// 같은 클라이언트의 데이터그램은 호출 순서대로 하나씩 처리된다.
    /// 느린 `open` 도중 들어온 ACK나 재전송된 RRQ도 앞선 요청이 끝난 뒤에 본다.
    /// 서로 다른 클라이언트는 서로를 기다리지 않는다.
    pub async fn handle_datagram(&self, client: SocketAddr, datagram: &[u8]) -> Option<Bytes> {
        let gate = self.endpoints.entry(client).or_default().value().clone();

        let reply = {
            let _turn = gate.lock().await;
            self.process_datagram(client, datagram).await
        };

        // 기다리는 태스크가 없으면(테이블 + 자신) 게이트 제거
        self.endpoints.remove_if(&client, |_, current| {
            Arc::ptr_eq(current, &gate) && Arc::strong_count(current) == 2
        });

        reply
    }

    /// 백엔드 에러를 포함한 모든 실패는 여기서 에러 패킷으로 바뀐다.
    async fn process_datagram(&self, client: SocketAddr, datagram: &[u8]) -> Option<Bytes> {
        let reply = match Packet::from_bytes(datagram) {
            Ok(packet) => self.handle_packet(client, packet).await,
            Err(e) => Err(e),
        };

        match reply.and_then(|packet| packet.map(|p| p.to_bytes()).transpose()) {
            Ok(bytes) => bytes,
            Err(e) => Some(self.fail(client, e)),
        }
    }

    /// 디코딩된 패킷 처리
    async fn handle_packet(&self, client: SocketAddr, packet: Packet) -> Result<Option<Packet>> {
        match packet {
            Packet::ReadRequest(req) => self.handle_read_request(client, req).await.map(Some),
            Packet::Ack(block) => self.handle_ack(client, block).await,
            Packet::Unsupported(opcode) => Err(Error::UnsupportedOpcode(opcode)),
            other => Err(Error::UnsupportedOpcode(opcode_of(&other))),
        }
    }

    /// 읽기 요청: 세션 생성 후 OACK 또는 첫 블록
    async fn handle_read_request(&self, client: SocketAddr, req: ReadRequest) -> Result<Packet> {
        info!(client = %client, "GET {} ({})", req.filename, req.mode);

        if !req.mode.eq_ignore_ascii_case(OCTET_MODE) {
            return Err(Error::UnsupportedMode { mode: req.mode });
        }

        let resolved = self.backend.sanitize(&req.filename).map_err(|e| match e {
            Error::Security(_) => e,
            other => Error::Security(other.to_string()),
        })?;

        let content = self.backend.open(&resolved, client).await?;
        let mut session = Session::new(
            client,
            req.filename.as_str(),
            resolved,
            content,
            self.backend.clone(),
        );

        let negotiated = req
            .option(BLKSIZE_OPTION)
            .map(parse_block_size)
            .transpose()?;

        let reply = match negotiated {
            Some(block_size) => {
                // 클라이언트의 ACK(0)을 받은 뒤 첫 블록을 보낸다
                session.block_size = block_size;
                debug!(client = %client, "Negotiated blksize {}", block_size);
                Packet::OptionAck(vec![(BLKSIZE_OPTION.to_string(), block_size.to_string())])
            }
            None => self.next_data(&mut session).await?,
        };

        self.sessions.insert(session);
        self.stats.record_session_started();

        Ok(reply)
    }

    /// ACK: 다음 블록, 재전송, 또는 전송 완료
    async fn handle_ack(&self, client: SocketAddr, block: u16) -> Result<Option<Packet>> {
        debug!(client = %client, "ACK (block {})", block);

        // 세션 없는 ACK는 조용히 무시
        let Some(shared) = self.sessions.get(&client) else {
            return Ok(None);
        };
        let mut session = shared.lock().await;

        // 먼저 온 최종 ACK가 이미 완료 처리한 세션
        if session.is_released() {
            return Ok(None);
        }

        if u64::from(block) == session.next_block() {
            if session.at_eof {
                info!(
                    client = %client,
                    "Transfer of {} successful",
                    session.requested_name()
                );
                session.release();
                drop(session);
                self.sessions.remove_session(&client, &shared);
                self.stats.record_completed();
                return Ok(None);
            }

            session.block_id += 1;
        }

        // 다음 블록, 또는 중복/순서 어긋난 ACK에 대한 현재 블록 재전송
        self.next_data(&mut session).await.map(Some)
    }

    /// 세션의 현재 블록(`block_id + 1`)을 DATA 패킷으로
    async fn next_data(&self, session: &mut Session) -> Result<Packet> {
        let block = session.next_block();
        if block > u64::from(u16::MAX) {
            return Err(Error::BlockOverflow {
                block,
                block_size: session.block_size,
            });
        }

        let (payload, retransmit) = session.read_next_block().await?;
        if retransmit {
            debug!(client = %session.client(), "Retransmitting block {}", block);
        }
        self.stats.record_block(payload.len(), retransmit);

        Ok(Packet::Data { block, payload })
    }

    /// 에러 패킷 생성 + 세션 종료
    ///
    /// 예상하지 못한 에러의 상세 내용은 로그에만 남는다.
    fn fail(&self, client: SocketAddr, err: Error) -> Bytes {
        if err.is_internal() {
            error!(client = %client, "Internal error: {:?}", err);
        } else {
            warn!(client = %client, "{}", err);
        }

        self.sessions.remove(&client);
        self.stats.record_failed();

        let packet = Packet::error(err.error_code(), err.client_message());
        // 에러 패킷 인코딩은 실패하지 않는다
        packet.to_bytes().unwrap_or_default()
    }

    /// 유휴 타임아웃: 살아 있는 세션을 모두 해제
    ///
    /// 세션별 경과 시간은 보지 않는다. 한 번의 유휴 주기 동안 아무 패킷도
    /// 없었다면 남은 세션은 전송을 포기한 클라이언트의 것으로 본다.
    pub fn reap_sessions(&self) -> usize {
        let reaped = self.sessions.clear();
        if reaped > 0 {
            self.stats.record_reaped(reaped as u64);
        }
        reaped
    }
}

fn opcode_of(packet: &Packet) -> u16 {
    use crate::packet::Opcode;

    match packet {
        Packet::ReadRequest(_) => Opcode::ReadRequest.as_u16(),
        Packet::Data { .. } => Opcode::Data.as_u16(),
        Packet::Ack(_) => Opcode::Ack.as_u16(),
        Packet::Error { .. } => Opcode::Error.as_u16(),
        Packet::OptionAck(_) => Opcode::OptionAck.as_u16(),
        Packet::Unsupported(opcode) => *opcode,
    }
}

/// `blksize` 값 검증
fn parse_block_size(value: &str) -> Result<usize> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|size| (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(size))
        .ok_or_else(|| Error::InvalidOption {
            name: BLKSIZE_OPTION.to_string(),
            value: value.to_string(),
        })
}
