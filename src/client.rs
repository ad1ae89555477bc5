//! 최소 TFTP 읽기 클라이언트
//!
//! 서버 점검과 통합 테스트용. 한 번에 파일 하나를 받는다.
//! 응답이 없으면 마지막으로 보낸 패킷(RRQ 또는 ACK)을 다시 보낸다.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::packet::{Packet, ReadRequest};
use crate::{Error, Result, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE};

/// TFTP 클라이언트
pub struct Client {
    socket: UdpSocket,
    server: SocketAddr,
    timeout: Duration,
    retries: u32,
}

impl Client {
    pub async fn bind(bind_addr: SocketAddr, server: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            socket,
            server,
            timeout: Duration::from_secs(1),
            retries: 5,
        })
    }

    /// 응답 대기 시간
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 연속 타임아웃 허용 횟수
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// 파일 하나 받기
    ///
    /// `blksize`를 주면 옵션 협상을 요청한다. 서버가 OACK 없이 바로 데이터를
    /// 보내면 기본 블록 크기로 진행한다.
    pub async fn get(&self, filename: &str, blksize: Option<usize>) -> Result<Vec<u8>> {
        let mut request = ReadRequest::new(filename, "octet");
        if let Some(size) = blksize {
            request = request.with_option("blksize", size.to_string());
        }

        let mut last_sent = Packet::ReadRequest(request).to_bytes()?;
        self.socket.send_to(&last_sent, self.server).await?;

        let mut block_size = DEFAULT_BLOCK_SIZE;
        let mut expected: u64 = 1;
        let mut received = Vec::new();
        let mut timeouts = 0;
        let mut buf = vec![0u8; MAX_BLOCK_SIZE + 4];

        loop {
            let (len, from) =
                match tokio::time::timeout(self.timeout, self.socket.recv_from(&mut buf)).await {
                    Ok(result) => result?,
                    Err(_) => {
                        timeouts += 1;
                        if timeouts > self.retries {
                            return Err(Error::Timeout(format!(
                                "no answer from {} for block {}",
                                self.server, expected
                            )));
                        }
                        debug!("Timeout waiting for block {}, resending", expected);
                        self.socket.send_to(&last_sent, self.server).await?;
                        continue;
                    }
                };

            if from != self.server {
                warn!("Ignoring datagram from unexpected peer {}", from);
                continue;
            }
            timeouts = 0;

            match Packet::from_bytes(&buf[..len])? {
                Packet::OptionAck(options) if expected == 1 => {
                    for (name, value) in &options {
                        if name.eq_ignore_ascii_case("blksize") {
                            block_size = value.parse().map_err(|_| Error::InvalidOption {
                                name: name.clone(),
                                value: value.clone(),
                            })?;
                        }
                    }
                    last_sent = Packet::Ack(0).to_bytes()?;
                    self.socket.send_to(&last_sent, self.server).await?;
                }
                Packet::Data { block, payload } if block == expected => {
                    let done = payload.len() < block_size;
                    received.extend_from_slice(&payload);

                    last_sent = ack_for(block, block_size)?;
                    self.socket.send_to(&last_sent, self.server).await?;

                    if done {
                        return Ok(received);
                    }
                    expected += 1;
                }
                Packet::Data { block, .. } => {
                    debug!("Ignoring duplicate block {} (expecting {})", block, expected);
                }
                Packet::Error { code, message } => {
                    return Err(Error::Remote { code, message });
                }
                other => {
                    debug!("Ignoring unexpected packet {:?}", other);
                }
            }
        }
    }
}

fn ack_for(block: u64, block_size: usize) -> Result<Bytes> {
    let block = u16::try_from(block).map_err(|_| Error::BlockOverflow { block, block_size })?;
    Packet::Ack(block).to_bytes()
}
