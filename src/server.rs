//! UDP 서버 루프
//!
//! 소켓 하나로 모든 클라이언트를 받는다. 데이터그램마다 태스크를 띄워 엔진에
//! 넘기고, 응답은 같은 소켓으로 보낸 곳에 돌려준다. 한 클라이언트의
//! 데이터그램 처리 순서는 엔진이 보장한다.
//!
//! 수신 대기가 `idle_timeout` 동안 아무것도 받지 못하면 남은 세션을 정리한다.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{self, Backend};
use crate::engine::Engine;
use crate::{Config, Result};

/// TFTP 서버
pub struct Server {
    config: Config,
    socket: Arc<UdpSocket>,
    engine: Arc<Engine>,
    shutdown: Arc<watch::Sender<bool>>,
}

/// 실행 중인 서버를 멈추는 핸들
#[derive(Clone)]
pub struct ShutdownHandle {
    shutdown: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// `run` 시작 전에 불러도 신호가 남는다
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Server {
    /// 설정 검증, 백엔드 생성 후 소켓 바인딩
    pub async fn bind(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = backend::from_config(&config)?;
        Self::with_backend(config, backend).await
    }

    /// 지정한 백엔드로 바인딩
    pub async fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!(
            "Listening on {} (backend: {})",
            socket.local_addr()?,
            backend.name()
        );

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            socket: Arc::new(socket),
            engine: Arc::new(Engine::new(backend)),
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// 종료 신호가 올 때까지 요청 처리
    pub async fn run(&self) -> Result<()> {
        let idle_timeout = self.config.idle_timeout();
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.config.recv_buffer_size];

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                _ = shutdown.changed() => {}

                received = tokio::time::timeout(idle_timeout, self.socket.recv_from(&mut buf)) => {
                    match received {
                        Ok(Ok((len, peer))) => self.dispatch(peer, buf[..len].to_vec()),
                        Ok(Err(e)) => warn!("Receive failed: {}", e),
                        Err(_) => {
                            let reaped = self.engine.reap_sessions();
                            if reaped > 0 {
                                info!("Idle timeout: released {} session(s)", reaped);
                                info!("{}", self.engine.stats().summary());
                            }
                        }
                    }
                }
            }
        }

        let remaining = self.engine.sessions().clear();
        info!(
            "Server stopped ({} session(s) released). {}",
            remaining,
            self.engine.stats().summary()
        );
        Ok(())
    }

    /// 데이터그램 하나를 별도 태스크에서 처리
    fn dispatch(&self, peer: SocketAddr, datagram: Vec<u8>) {
        let engine = self.engine.clone();
        let socket = self.socket.clone();

        tokio::spawn(async move {
            let Some(reply) = engine.handle_datagram(peer, &datagram).await else {
                return;
            };

            match socket.send_to(&reply, peer).await {
                Ok(_) => debug!(client = %peer, "Sent {} bytes", reply.len()),
                Err(e) => warn!(client = %peer, "Send failed: {}", e),
            }
        });
    }
}
