use crate::auth::Auth;
use crate::config::Socks5Upstream;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;

/// Error type for SOCKS5 connection operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("SOCKS5 connection to {proxy} failed: {source}")]
    ConnectionFailed {
        proxy: String,
        #[source]
        source: tokio_socks::Error,
    },

    #[error("SOCKS5 connection to {proxy} timed out after {timeout:?}")]
    Timeout { proxy: String, timeout: Duration },

    #[error("destination {0:?} has no host")]
    MissingHost(String),
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Dials destinations through one upstream SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct SocksConnector {
    proxy_addr: Arc<str>,
    auth: Option<Arc<Auth>>,
    connect_timeout: Duration,
}

impl SocksConnector {
    pub fn new(upstream: &Socks5Upstream, connect_timeout: Duration) -> Self {
        Self {
            proxy_addr: Arc::from(upstream.addr.as_str()),
            auth: upstream.auth.clone().map(Arc::new),
            connect_timeout,
        }
    }

    /// Open a SOCKS5 stream to `host:port`.
    ///
    /// The host name is passed to the proxy unresolved, so DNS happens on the
    /// proxy side.
    pub async fn connect(&self, host: &str, port: u16) -> SocksResult<Socks5Stream<TcpStream>> {
        let proxy = &*self.proxy_addr;
        let dial = async {
            match self.auth.as_deref() {
                Some(auth) => {
                    Socks5Stream::connect_with_password(
                        proxy,
                        (host, port),
                        &auth.username,
                        &auth.password,
                    )
                    .await
                }
                None => Socks5Stream::connect(proxy, (host, port)).await,
            }
        };

        match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(SocksError::ConnectionFailed {
                proxy: proxy.to_string(),
                source,
            }),
            Err(_) => Err(SocksError::Timeout {
                proxy: proxy.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }

    /// Open a SOCKS5 stream to the authority of `dst`
    pub async fn connect_uri(&self, dst: &http::Uri) -> SocksResult<Socks5Stream<TcpStream>> {
        let host = dst
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| SocksError::MissingHost(dst.to_string()))?;
        // IPv6 literals arrive bracketed in URIs
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = dst.port_u16().unwrap_or(match dst.scheme_str() {
            Some("https") => 443,
            _ => 80,
        });
        self.connect(host, port).await
    }
}
