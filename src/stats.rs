//! 서버 전송 통계

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 서버 전체 카운터 (여러 워커 태스크에서 동시에 갱신)
#[derive(Debug)]
pub struct ServerStats {
    /// 시작 시간
    start_time: Instant,

    /// 생성된 세션 수
    sessions_started: AtomicU64,

    /// 정상 완료된 전송 수
    transfers_completed: AtomicU64,

    /// 에러로 끝난 요청/세션 수
    transfers_failed: AtomicU64,

    /// 유휴 타임아웃으로 정리된 세션 수
    sessions_reaped: AtomicU64,

    /// 전송한 데이터 블록 수 (재전송 포함)
    blocks_sent: AtomicU64,

    /// 중복 ACK로 인한 재전송 수
    retransmits: AtomicU64,

    /// 전송한 페이로드 바이트
    bytes_sent: AtomicU64,
}

/// 특정 시점의 통계 복사본
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub sessions_reaped: u64,
    pub blocks_sent: u64,
    pub retransmits: u64,
    pub bytes_sent: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            sessions_started: AtomicU64::new(0),
            transfers_completed: AtomicU64::new(0),
            transfers_failed: AtomicU64::new(0),
            sessions_reaped: AtomicU64::new(0),
            blocks_sent: AtomicU64::new(0),
            retransmits: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn record_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reaped(&self, count: u64) {
        self.sessions_reaped.fetch_add(count, Ordering::Relaxed);
    }

    /// 데이터 블록 전송 기록
    pub fn record_block(&self, payload_len: usize, retransmit: bool) {
        self.blocks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload_len as u64, Ordering::Relaxed);
        if retransmit {
            self.retransmits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            sessions_reaped: self.sessions_reaped.load(Ordering::Relaxed),
            blocks_sent: self.blocks_sent.load(Ordering::Relaxed),
            retransmits: self.retransmits.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Uptime: {:.0}s | Sessions: {} | Completed: {} | Failed: {} | Reaped: {} | Blocks: {} (retransmits: {}) | Bytes: {}",
            self.elapsed().as_secs_f64(),
            s.sessions_started,
            s.transfers_completed,
            s.transfers_failed,
            s.sessions_reaped,
            s.blocks_sent,
            s.retransmits,
            s.bytes_sent,
        )
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = ServerStats::new();
        stats.record_session_started();
        stats.record_block(512, false);
        stats.record_block(512, true);
        stats.record_block(32, false);
        stats.record_completed();
        stats.record_reaped(3);

        let s = stats.snapshot();
        assert_eq!(s.sessions_started, 1);
        assert_eq!(s.blocks_sent, 3);
        assert_eq!(s.retransmits, 1);
        assert_eq!(s.bytes_sent, 1056);
        assert_eq!(s.transfers_completed, 1);
        assert_eq!(s.sessions_reaped, 3);
        assert!(stats.summary().contains("Reaped: 3"));
    }
}
