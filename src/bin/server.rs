//! tftproxy 서버 - 읽기 전용 TFTP 서버
//!
//! 파일시스템 루트의 파일과, 퍼센트 인코딩된 URL로 요청된 원격 파일을 제공한다.
//!
//! 사용법:
//!   cargo run --release --bin tftproxy-server -- [OPTIONS]
//!
//! 예시:
//!   # 파일시스템만
//!   cargo run --release --bin tftproxy-server -- --root /srv/tftp --backend fs
//!
//!   # URL 요청 허용 (화이트리스트 지정)
//!   cargo run --release --bin tftproxy-server -- --root /srv/tftp \
//!       --http-opt 'whitelist=https://boot\.example\.com/' --http-opt max_size=100000000

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tftproxy::{BackendKind, Config, HttpConfig, Server};

/// 읽기 전용 TFTP 서버
#[derive(Parser, Debug)]
#[command(name = "tftproxy-server", version, about)]
struct Args {
    /// 바인드 주소
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// 바인드 포트
    #[arg(short, long, default_value_t = tftproxy::DEFAULT_PORT)]
    port: u16,

    /// 파일시스템 백엔드 루트
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// 백엔드 (fs, http, composite)
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// TOML 설정 파일. 명령행 옵션이 우선한다.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 원격 fetch 옵션 (key=value, 반복 가능)
    #[arg(long = "http-opt", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    http_opts: Vec<(String, String)>,

    /// 유휴 세션 정리 주기 (밀리초)
    #[arg(long)]
    idle_timeout_ms: Option<u64>,

    /// 로그 상세도 (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {}", s))
}

fn build_config(args: &Args) -> tftproxy::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };

    config.bind_addr = SocketAddr::new(args.host, args.port);
    if let Some(root) = &args.root {
        config.root = root.clone();
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(ms) = args.idle_timeout_ms {
        config.idle_timeout_ms = ms;
    }
    if !args.http_opts.is_empty() {
        config.http = HttpConfig::from_options(args.http_opts.iter().cloned())?;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // 로깅 설정 (RUST_LOG가 있으면 우선)
    let level = match args.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&args)?;

    info!("tftproxy server starting...");
    info!("Bind address: {}", config.bind_addr);
    info!("Backend: {}", config.backend);
    if config.backend != BackendKind::Http {
        info!("Root: {}", config.root.display());
    }
    if config.backend != BackendKind::Filesystem {
        info!("Cache dir: {}", config.http.cache_dir.display());
        info!("Whitelist: {:?}", config.http.whitelist);
    }

    let server = Arc::new(Server::bind(config).await?);

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            shutdown.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}
