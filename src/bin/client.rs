//! tftproxy 클라이언트 - 파일 하나 받기
//!
//! 사용법:
//!   cargo run --release --bin tftproxy-client -- [OPTIONS] <FILENAME>
//!
//! 예시:
//!   cargo run --release --bin tftproxy-client -- -s 127.0.0.1:69 -o pxelinux.0 pxelinux.0
//!   cargo run --release --bin tftproxy-client -- --blksize 1468 'http%3A%2F%2Fmirror%2Fboot.img'

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tftproxy::Client;

/// 읽기 전용 TFTP 클라이언트
#[derive(Parser, Debug)]
#[command(name = "tftproxy-client", version, about)]
struct Args {
    /// 서버 주소
    #[arg(short, long, default_value = "127.0.0.1:69")]
    server: SocketAddr,

    /// 로컬 바인드 주소
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// 저장 경로 (기본: 요청 이름의 마지막 부분)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 블록 크기 협상
    #[arg(long)]
    blksize: Option<usize>,

    /// 응답 대기 시간 (밀리초)
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// 연속 타임아웃 허용 횟수
    #[arg(long, default_value_t = 5)]
    retries: u32,

    /// 요청할 파일 이름
    filename: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let output = args.output.clone().unwrap_or_else(|| {
        let name = args.filename.rsplit('/').next().unwrap_or(&args.filename);
        PathBuf::from(if name.is_empty() { "download.bin" } else { name })
    });

    let client = Client::bind(args.bind, args.server)
        .await?
        .with_timeout(Duration::from_millis(args.timeout_ms))
        .with_retries(args.retries);

    info!("GET {} from {}", args.filename, args.server);
    let start = Instant::now();
    let data = client.get(&args.filename, args.blksize).await?;
    let elapsed = start.elapsed();

    tokio::fs::write(&output, &data).await?;

    info!("Received {} bytes in {:.2}s", data.len(), elapsed.as_secs_f64());
    info!("Saved to {}", output.display());
    Ok(())
}
