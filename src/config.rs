use crate::access_log::DEFAULT_QUEUE_CAPACITY;
use crate::auth::Auth;
use crate::rate_limit::{DEFAULT_CAPACITY, DEFAULT_WINDOW};
use clap::Parser;
use percent_encoding::percent_decode_str;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Environment variable naming the optional upstream SOCKS5 proxy
pub const SOCKS5_ENV_KEY: &str = "SOCKS5_URL";

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Single-upstream reverse proxy",
    long_about = "relay-proxy forwards every request to one fixed upstream, optionally through an upstream SOCKS5 proxy.\n\nFeatures:\n- Per-IP token-bucket rate limiting (429 when exceeded)\n- Proxy fingerprint removal and browser-like request headers\n- Daily access-YYYY-MM-DD.log and error-YYYY-MM-DD.log files\n- GET /healthz liveness endpoint\n"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Upstream every request is forwarded to
    #[arg(long, env = "UPSTREAM_URL", default_value = "https://translate.google.com")]
    pub upstream: String,

    /// Upstream SOCKS5 proxy: socks5://[user[:pass]@]host:port
    #[arg(long = "socks5-url", env = "SOCKS5_URL")]
    pub socks5_url: Option<String>,

    /// Directory for access and error log files
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    /// Requests allowed per IP within one rate window (also the burst size)
    #[arg(long, env = "RATE_LIMIT", default_value_t = DEFAULT_CAPACITY)]
    pub rate_limit: u32,

    /// Rate window in seconds
    #[arg(long, env = "RATE_WINDOW", default_value_t = DEFAULT_WINDOW.as_secs())]
    pub rate_window: u64,

    /// Pending access-log lines kept before new ones are dropped
    #[arg(long, env = "ACCESS_LOG_QUEUE", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub access_queue: usize,

    /// Seconds to wait for the upstream response head
    #[arg(long, env = "RESPONSE_TIMEOUT", default_value_t = 60)]
    pub response_timeout: u64,

    /// Take the client IP from X-Forwarded-For / X-Real-IP when present
    #[arg(long, env = "TRUST_FORWARDED", default_value_t = true, action = clap::ArgAction::Set)]
    pub trust_forwarded: bool,
}

/// Configuration errors; all of them abort startup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {key}={value:?}: {reason}")]
    InvalidSocks5Url {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} must start with socks5://, got: {value:?}")]
    NotSocks5 { key: &'static str, value: String },

    #[error("{key} missing host:port, got: {value:?}")]
    MissingHostPort { key: &'static str, value: String },

    #[error("invalid upstream {value:?}: {reason}")]
    InvalidUpstream { value: String, reason: String },
}

/// Parsed upstream SOCKS5 endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Upstream {
    /// `host:port` of the SOCKS5 server, resolved at dial time
    pub addr: String,
    pub auth: Option<Auth>,
}

impl Socks5Upstream {
    /// Parse `socks5://[user[:pass]@]host:port`
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidSocks5Url {
            key: SOCKS5_ENV_KEY,
            value: redacted(raw),
            reason: e.to_string(),
        })?;

        if url.scheme() != "socks5" {
            return Err(ConfigError::NotSocks5 {
                key: SOCKS5_ENV_KEY,
                value: redacted(raw),
            });
        }

        let missing = || ConfigError::MissingHostPort {
            key: SOCKS5_ENV_KEY,
            value: redacted(raw),
        };
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(missing)?;
        // socks5 has no default port in the url crate, so an explicit one is required
        let port = url.port().ok_or_else(missing)?;
        // host_str keeps IPv6 brackets, which is what host:port needs
        let addr = format!("{}:{}", host, port);

        let username = decode(url.username());
        let password = url.password().map(decode).unwrap_or_default();
        let auth = match (username.is_empty(), password.is_empty()) {
            (true, true) => None,
            // RFC 1929 fields are 1..=255 bytes each
            (false, false) if username.len() <= 255 && password.len() <= 255 => {
                Some(Auth::new(username, password))
            }
            _ => {
                return Err(ConfigError::InvalidSocks5Url {
                    key: SOCKS5_ENV_KEY,
                    value: redacted(raw),
                    reason: "credentials need a user and a password of 1 to 255 bytes".to_string(),
                })
            }
        };

        Ok(Self { addr, auth })
    }
}

/// `raw` with any embedded password masked, for error messages
fn redacted(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("xxxxx"));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

fn decode(component: &str) -> String {
    percent_decode_str(component).decode_utf8_lossy().into_owned()
}

/// Proxy configuration derived from CLI arguments and environment
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream: http::Uri,
    pub socks5: Option<Socks5Upstream>,
    pub log_dir: PathBuf,
    pub rate_limit: u32,
    pub rate_window: Duration,
    pub access_queue: usize,
    pub response_timeout: Duration,
    pub trust_forwarded: bool,
}

impl ProxyConfig {
    /// Validate CLI arguments into a configuration
    pub fn from_cli(args: Cli) -> Result<Self, ConfigError> {
        let upstream = parse_upstream(&args.upstream)?;

        // A blank SOCKS5_URL means "not configured"
        let socks5 = match args.socks5_url.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(Socks5Upstream::parse(raw)?),
            _ => None,
        };

        Ok(Self {
            listen_addr: args.listen,
            upstream,
            socks5,
            log_dir: args.log_dir,
            rate_limit: args.rate_limit,
            rate_window: Duration::from_secs(args.rate_window),
            access_queue: args.access_queue,
            response_timeout: Duration::from_secs(args.response_timeout),
            trust_forwarded: args.trust_forwarded,
        })
    }
}

/// The upstream must be an absolute http(s) URL
pub fn parse_upstream(raw: &str) -> Result<http::Uri, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidUpstream {
        value: redacted(raw),
        reason: reason.to_string(),
    };

    let uri: http::Uri = raw.trim().parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;
    match uri.scheme_str() {
        Some("http") | Some("https") => {}
        _ => return Err(invalid("scheme must be http or https")),
    }
    if uri.host().map_or(true, str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(uri)
}
