//! 서버 설정
//!
//! 서버 생성 후에는 변경되지 않는다. 코드에서 직접 만들거나
//! TOML 파일에서 읽을 수 있다.
//!
//! ```toml
//! bind_addr = "0.0.0.0:69"
//! root = "/var/lib/tftpboot"
//! backend = "composite"
//!
//! [http]
//! cache_dir = "/var/cache/tftproxy/http"
//! timeout_ms = 3000
//! max_size = 50000000
//! whitelist = ["https://boot\\.example\\.com/"]
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, DEFAULT_PORT};

/// 요청을 처리할 백엔드 선택
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 루트 디렉터리의 파일만 제공
    Filesystem,

    /// URL만 제공 (원격 fetch)
    Http,

    /// 요청 이름 형태에 따라 위 둘 중 하나로 분기
    #[default]
    Composite,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fs" | "filesystem" => Ok(BackendKind::Filesystem),
            "http" => Ok(BackendKind::Http),
            "composite" => Ok(BackendKind::Composite),
            other => Err(Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Filesystem => "filesystem",
            BackendKind::Http => "http",
            BackendKind::Composite => "composite",
        };
        f.write_str(name)
    }
}

/// 서버 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 바인드 주소
    pub bind_addr: SocketAddr,

    /// 파일시스템 백엔드 루트
    pub root: PathBuf,

    /// 수신 대기 타임아웃 (밀리초)
    /// 이 시간 동안 아무 패킷도 없으면 남은 세션을 모두 정리한다
    pub idle_timeout_ms: u64,

    /// 수신 버퍼 크기
    pub recv_buffer_size: usize,

    /// 백엔드 선택
    pub backend: BackendKind,

    /// 원격 fetch 백엔드 설정
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            root: PathBuf::from("/var/lib/tftpboot"),
            idle_timeout_ms: 5000,   // 5초
            recv_buffer_size: 65535, // UDP 최대
            backend: BackendKind::Composite,
            http: HttpConfig::default(),
        }
    }
}

impl Config {
    /// 로컬 테스트용 설정 (루프백, 임의 포트, 파일시스템 백엔드)
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            root: root.into(),
            idle_timeout_ms: 1000,
            backend: BackendKind::Filesystem,
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// TOML 문자열에서 읽기 (빠진 항목은 기본값)
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 읽기
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout_ms == 0 {
            return Err(Error::Config("idle_timeout_ms must be positive".into()));
        }
        if self.recv_buffer_size < 4 {
            return Err(Error::Config("recv_buffer_size too small".into()));
        }
        self.http.validate()
    }
}

/// 원격 fetch 백엔드 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// 다운로드한 파일을 보관할 디렉터리 (없으면 생성)
    pub cache_dir: PathBuf,

    /// 요청 시작부터 다운로드 완료까지 허용 시간 (밀리초)
    pub timeout_ms: u64,

    /// 최대 다운로드 크기 (바이트)
    pub max_size: u64,

    /// 허용 URL 패턴 (정규식, URL 앞부분에 매칭)
    pub whitelist: Vec<String>,

    /// 리다이렉트 추적 여부
    pub allow_redirects: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/tftproxy/http"),
            timeout_ms: 3000,      // 3초
            max_size: 50_000_000, // 50MB
            whitelist: vec![".*".to_string()],
            allow_redirects: false,
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// 키/값 옵션 하나 적용
    ///
    /// `whitelist`는 패턴을 하나씩 추가한다.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let bad_value = || Error::Config(format!("invalid value for {}: {}", key, value));

        match key {
            "cache_dir" => self.cache_dir = PathBuf::from(value),
            "timeout_ms" => self.timeout_ms = value.parse().map_err(|_| bad_value())?,
            "max_size" => self.max_size = value.parse().map_err(|_| bad_value())?,
            "whitelist" => self.whitelist.push(value.to_string()),
            "allow_redirects" => self.allow_redirects = value.parse().map_err(|_| bad_value())?,
            other => return Err(Error::Config(format!("unknown http option: {}", other))),
        }
        Ok(())
    }

    /// 키/값 옵션 목록으로 설정 생성
    ///
    /// `whitelist`가 한 번이라도 주어지면 기본 패턴(`.*`)은 대체된다.
    pub fn from_options<I, K, V>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let mut whitelist_given = false;

        for (key, value) in options {
            let key = key.as_ref();
            if key == "whitelist" && !whitelist_given {
                config.whitelist.clear();
                whitelist_given = true;
            }
            config.set(key, value.as_ref())?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for pattern in &self.whitelist {
            regex::Regex::new(pattern)
                .map_err(|e| Error::Config(format!("bad whitelist pattern {}: {}", pattern, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bind_addr.port(), 69);
        assert_eq!(config.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.backend, BackendKind::Composite);
        assert_eq!(config.http.timeout(), Duration::from_secs(3));
        assert_eq!(config.http.max_size, 50_000_000);
        assert_eq!(config.http.whitelist, vec![".*"]);
        assert!(!config.http.allow_redirects);
    }

    #[test]
    fn test_http_from_options() {
        let http = HttpConfig::from_options([
            ("cache_dir", "/tmp/cache"),
            ("whitelist", "http://www\\.download\\.tld"),
            ("whitelist", "https://mirror\\."),
            ("max_size", "1000"),
            ("timeout_ms", "1"),
        ])
        .unwrap();

        assert_eq!(http.cache_dir, PathBuf::from("/tmp/cache"));
        assert_eq!(http.whitelist.len(), 2);
        assert_eq!(http.max_size, 1000);
        assert_eq!(http.timeout(), Duration::from_millis(1));
    }

    #[test]
    fn test_http_bad_options() {
        assert!(HttpConfig::from_options([("max_size", "lots")]).is_err());
        assert!(HttpConfig::from_options([("proxy", "socks5://x")]).is_err());
        assert!(HttpConfig::from_options([("whitelist", "([unclosed")]).is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = Config::from_toml_str(
            r#"
            bind_addr = "127.0.0.1:6969"
            root = "/srv/tftp"
            backend = "filesystem"

            [http]
            max_size = 1234
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr.port(), 6969);
        assert_eq!(config.root, PathBuf::from("/srv/tftp"));
        assert_eq!(config.backend, BackendKind::Filesystem);
        assert_eq!(config.http.max_size, 1234);
        // 빠진 항목은 기본값
        assert_eq!(config.idle_timeout_ms, 5000);
        assert_eq!(config.http.timeout_ms, 3000);
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("fs".parse::<BackendKind>().unwrap(), BackendKind::Filesystem);
        assert_eq!("HTTP".parse::<BackendKind>().unwrap(), BackendKind::Http);
        assert!("ftp".parse::<BackendKind>().is_err());
    }
}
