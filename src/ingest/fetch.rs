//! Remote image fetching
//!
//! The client never resolves names on its own: [`GuardedResolver`] routes
//! every connection through [`SsrfGuard::resolve_checked`], and the redirect
//! policy re-checks each hop. Bodies are streamed and abandoned as soon as
//! they cross the byte cap.

use super::ssrf::SsrfGuard;
use crate::error::{ForgeError, ForgeResult};
use bytes::{Bytes, BytesMut};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::{redirect, Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body and headers of a successful fetch
#[derive(Debug)]
pub struct FetchedBody {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub final_url: String,
}

/// DNS resolver that applies the SSRF policy at connection time
struct GuardedResolver {
    guard: Arc<SsrfGuard>,
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let guard = Arc::clone(&self.guard);
        Box::pin(async move {
            // The connector substitutes the URL's port
            match guard.resolve_checked(name.as_str(), 0).await {
                Ok(addrs) => {
                    let addrs: Addrs = Box::new(addrs.into_iter());
                    Ok(addrs)
                }
                Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
            }
        })
    }
}

/// HTTP fetcher with SSRF protection and a byte cap
pub struct HttpFetcher {
    client: Client,
    guard: Arc<SsrfGuard>,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(
        guard: Arc<SsrfGuard>,
        max_bytes: u64,
        timeout: Duration,
        max_redirects: usize,
    ) -> ForgeResult<Self> {
        let policy_guard = Arc::clone(&guard);
        let policy = redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > max_redirects {
                let url = attempt.url().to_string();
                return attempt.error(ForgeError::fetch(url, "too many redirects"));
            }
            match check_url(&policy_guard, attempt.url()) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e),
            }
        });

        let client = Client::builder()
            .timeout(timeout)
            .redirect(policy)
            // A proxy would resolve names itself and bypass the guard
            .no_proxy()
            .dns_resolver(Arc::new(GuardedResolver {
                guard: Arc::clone(&guard),
            }))
            .user_agent(concat!("imgforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForgeError::Internal(format!("building HTTP client: {}", e)))?;

        Ok(Self {
            client,
            guard,
            max_bytes,
        })
    }

    /// Fetch a URL into memory
    pub async fn fetch(&self, url: &str) -> ForgeResult<FetchedBody> {
        let parsed = Url::parse(url)
            .map_err(|e| ForgeError::validation(format!("invalid URL '{}': {}", url, e)))?;
        check_url(&self.guard, &parsed)?;

        let mut response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForgeError::fetch(url, format!("HTTP {}", status)));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                return Err(ForgeError::PayloadTooLarge {
                    size: length,
                    limit: self.max_bytes,
                });
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().to_string();

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify(url, e))? {
            let size = (body.len() + chunk.len()) as u64;
            if size > self.max_bytes {
                debug!("Aborting fetch of {} after {} bytes", url, size);
                return Err(ForgeError::PayloadTooLarge {
                    size,
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        debug!("Fetched {} ({} bytes)", final_url, body.len());
        Ok(FetchedBody {
            bytes: body.freeze(),
            content_type,
            final_url,
        })
    }
}

/// Scheme and host-literal checks shared by the first request and redirects
fn check_url(guard: &SsrfGuard, url: &Url) -> ForgeResult<()> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ForgeError::validation(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ForgeError::validation(format!("URL has no host: {}", url)))?;
    guard.check_literal(host)
}

/// Recover our own error from reqwest's source chain
///
/// Resolver and redirect failures travel through hyper boxed inside
/// reqwest's error; surfacing the original keeps `SsrfBlocked` distinct
/// from ordinary network failures.
fn classify(url: &str, err: reqwest::Error) -> ForgeError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = source {
        if let Some(ours) = e.downcast_ref::<ForgeError>() {
            return ours.clone();
        }
        source = e.source();
    }

    let reason = if err.is_timeout() {
        "timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    };
    ForgeError::fetch(url, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ingest::ssrf::testing::ScriptedResolver;
    use crate::ingest::ssrf::SystemResolver;
    use std::net::IpAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection on a local port
    async fn serve(responses: Vec<Vec<u8>>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 4096];
                let mut read = 0;
                while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf[read..]).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    read += n;
                }
                let _ = socket.write_all(&response).await;
                let _ = socket.shutdown().await;
            }
        });
        port
    }

    fn ok_response(body: &[u8], with_length: bool) -> Vec<u8> {
        let mut head = String::from("HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nConnection: close\r\n");
        if with_length {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        head.push_str("\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn fetcher(guard: SsrfGuard, max_bytes: u64) -> HttpFetcher {
        HttpFetcher::new(Arc::new(guard), max_bytes, Duration::from_secs(5), 3).unwrap()
    }

    fn open_guard() -> SsrfGuard {
        SsrfGuard::new(false, vec![], Arc::new(SystemResolver))
    }

    #[tokio::test]
    async fn fetches_body_when_protection_disabled() {
        let port = serve(vec![ok_response(b"hello", true)]).await;
        let body = fetcher(open_guard(), 1024)
            .fetch(&format!("http://127.0.0.1:{}/a.png", port))
            .await
            .unwrap();
        assert_eq!(&body.bytes[..], b"hello");
        assert_eq!(body.content_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn loopback_literal_blocked() {
        let guard = SsrfGuard::new(true, vec![], Arc::new(SystemResolver));
        let err = fetcher(guard, 1024)
            .fetch("http://127.0.0.1:9/a.png")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SsrfBlocked);
    }

    #[tokio::test]
    async fn non_http_scheme_rejected() {
        let err = fetcher(open_guard(), 1024)
            .fetch("file:///etc/passwd")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn content_length_over_cap_rejected() {
        let port = serve(vec![ok_response(&[0u8; 64], true)]).await;
        let err = fetcher(open_guard(), 16)
            .fetch(&format!("http://127.0.0.1:{}/big.png", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::PayloadTooLarge { size: 64, limit: 16 }));
    }

    #[tokio::test]
    async fn streamed_body_over_cap_aborted() {
        let port = serve(vec![ok_response(&[0u8; 64], false)]).await;
        let err = fetcher(open_guard(), 16)
            .fetch(&format!("http://127.0.0.1:{}/big.png", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::PayloadTooLarge { limit: 16, .. }));
    }

    #[tokio::test]
    async fn rebinding_caught_at_connect_time() {
        let public: IpAddr = "93.184.216.34".parse().unwrap();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let port = serve(vec![ok_response(b"secret", true)]).await;
        // First answer satisfies validation, the second is what the connector sees
        let resolver = ScriptedResolver::new(vec![vec![public], vec![loopback]]);
        let guard = SsrfGuard::new(true, vec![], resolver.clone());
        let guard = Arc::new(guard);
        guard.resolve_checked("rebind.test", port).await.unwrap();

        let fetcher = HttpFetcher::new(guard, 1024, Duration::from_secs(5), 3).unwrap();
        let err = fetcher
            .fetch(&format!("http://rebind.test:{}/x.png", port))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SsrfBlocked);
        assert!(resolver.calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn redirect_to_internal_literal_blocked() {
        let redirect = b"HTTP/1.1 302 Found\r\nLocation: http://169.254.169.254/latest/meta-data\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
        let port = serve(vec![redirect]).await;
        let resolver = ScriptedResolver::new(vec![vec!["127.0.0.1".parse().unwrap()]]);
        // Allow-list the origin so only the redirect hop is subject to the check
        let guard = SsrfGuard::new(true, vec!["origin.test".to_string()], resolver);
        let err = fetcher(guard, 1024)
            .fetch(&format!("http://origin.test:{}/start", port))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SsrfBlocked);
    }

    #[tokio::test]
    async fn http_error_status_is_fetch_error() {
        let not_found =
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec();
        let port = serve(vec![not_found]).await;
        let err = fetcher(open_guard(), 1024)
            .fetch(&format!("http://127.0.0.1:{}/missing.png", port))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(err.is_retryable());
    }
}
