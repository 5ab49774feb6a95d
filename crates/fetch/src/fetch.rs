//! Bounded GET with a single end-to-end deadline.

use crate::safety::{FetchPolicy, checked_addrs};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("URL scheme is not https")]
    NotHttps,
    #[error("destination {0} is a private address")]
    PrivateIp(IpAddr),
    #[error("destination {0} is a loopback address")]
    Loopback(IpAddr),
    #[error("destination {0} is a link-local address")]
    LinkLocal(IpAddr),
    #[error("DNS resolution failed: {0}")]
    DnsFailure(String),
    #[error("redirect to a different origin")]
    CrossOriginRedirect,
    #[error("fetch deadline exceeded")]
    Timeout,
    #[error("response exceeded {limit} bytes")]
    ResponseTooLarge { limit: usize },
    #[error("fetch failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_bytes: usize,
    pub timeout: Duration,
    pub allow_redirects: bool,
    pub extra_headers: Vec<(String, String)>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024,
            timeout: Duration::from_secs(5),
            allow_redirects: false,
            extra_headers: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct FetchedBody {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// HTTPS GET with destination checks, pinned resolution, no proxies, no
/// implicit redirects, and a streamed byte cap.
#[derive(Debug, Clone)]
pub struct SafeFetcher {
    policy: FetchPolicy,
}

impl SafeFetcher {
    #[must_use]
    pub fn new(policy: FetchPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Fetch `url`, enforcing the policy and `opts` bounds.
    ///
    /// The deadline in `opts.timeout` covers DNS, connect, TLS, and the full
    /// body read.
    pub async fn get(&self, url: &str, opts: &FetchOptions) -> Result<FetchedBody, FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::Failed(format!("invalid URL: {e}")))?;
        tokio::time::timeout(opts.timeout, self.get_inner(url, opts))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn get_inner(&self, mut url: Url, opts: &FetchOptions) -> Result<FetchedBody, FetchError> {
        let origin = url.origin();
        // Redirects are followed manually; every hop re-runs the destination checks.
        let mut hops = 0;
        loop {
            let response = self.send_once(&url, opts).await?;
            let status = response.status();

            if status.is_redirection() {
                if !opts.allow_redirects {
                    return Err(FetchError::Failed(format!(
                        "redirect not followed (status {status})"
                    )));
                }
                hops += 1;
                if hops > 3 {
                    return Err(FetchError::Failed("too many redirects".into()));
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| FetchError::Failed("redirect without location".into()))?;
                let next = url
                    .join(location)
                    .map_err(|e| FetchError::Failed(format!("invalid redirect target: {e}")))?;
                if next.scheme() != "https" || next.origin() != origin {
                    return Err(FetchError::CrossOriginRedirect);
                }
                url = next;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::Failed(format!("unexpected status {status}")));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let bytes = read_body_limited(response, opts.max_bytes).await?;
            return Ok(FetchedBody {
                bytes,
                content_type,
            });
        }
    }

    async fn send_once(
        &self,
        url: &Url,
        opts: &FetchOptions,
    ) -> Result<reqwest::Response, FetchError> {
        let addrs = checked_addrs(&self.policy, url).await?;

        // Pin the connection to the vetted addresses; SNI and certificate
        // verification still use the original hostname.
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();
        if let Some(host) = url.host_str()
            && host.trim_matches(['[', ']']).parse::<IpAddr>().is_err()
        {
            builder = builder.resolve_to_addrs(host, &addrs);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Failed(format!("client build: {e}")))?;

        let mut request = client.get(url.clone());
        for (name, value) in &opts.extra_headers {
            request = request.header(name, value);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else {
                FetchError::Failed(sanitize_reqwest_error(&e))
            }
        })
    }
}

async fn read_body_limited(
    mut response: reqwest::Response,
    max_bytes: usize,
) -> Result<Vec<u8>, FetchError> {
    if let Some(len) = response.content_length()
        && len > max_bytes as u64
    {
        return Err(FetchError::ResponseTooLarge { limit: max_bytes });
    }

    let mut out: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| FetchError::Failed(sanitize_reqwest_error(&e)))?
    {
        if out.len().saturating_add(chunk.len()) > max_bytes {
            return Err(FetchError::ResponseTooLarge { limit: max_bytes });
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

/// Strip credentials/query from any URL reqwest embeds in its error text.
fn sanitize_reqwest_error(e: &reqwest::Error) -> String {
    let mut msg = e.to_string();
    if let Some(u) = e.url() {
        let mut redacted = u.clone();
        let _ = redacted.set_username("");
        let _ = redacted.set_password(None);
        redacted.set_query(None);
        redacted.set_fragment(None);
        msg = msg.replace(u.as_str(), redacted.as_str());
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;

    async fn spawn_stub(app: Router) -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
        tokio::spawn(async move {
            let _ = server.await;
        });
        (format!("http://{addr}"), shutdown_tx)
    }

    #[tokio::test]
    async fn strict_policy_blocks_http_without_any_io() {
        let fetcher = SafeFetcher::new(FetchPolicy::strict());
        let err = fetcher
            .get("http://unroutable.invalid/x", &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NotHttps));
    }

    #[tokio::test]
    async fn fetches_body_and_content_type() {
        let app = Router::new().route(
            "/doc",
            get(|| async { ([("content-type", "application/jose")], "abc.def.ghi") }),
        );
        let (base, _shutdown) = spawn_stub(app).await;

        let fetcher = SafeFetcher::new(FetchPolicy::insecure());
        let body = fetcher
            .get(&format!("{base}/doc"), &FetchOptions::default())
            .await
            .expect("fetch");
        assert_eq!(body.bytes, b"abc.def.ghi");
        assert_eq!(body.content_type.as_deref(), Some("application/jose"));
    }

    #[tokio::test]
    async fn enforces_byte_cap_mid_stream() {
        let app = Router::new().route("/big", get(|| async { "x".repeat(4096) }));
        let (base, _shutdown) = spawn_stub(app).await;

        let fetcher = SafeFetcher::new(FetchPolicy::insecure());
        let err = fetcher
            .get(
                &format!("{base}/big"),
                &FetchOptions {
                    max_bytes: 1024,
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn rejects_redirects_when_disabled() {
        let app = Router::new().route(
            "/hop",
            get(|| async {
                (
                    axum::http::StatusCode::FOUND,
                    [("location", "https://elsewhere.example/")],
                )
            }),
        );
        let (base, _shutdown) = spawn_stub(app).await;

        let fetcher = SafeFetcher::new(FetchPolicy::insecure());
        let err = fetcher
            .get(&format!("{base}/hop"), &FetchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Failed(_)));
    }

    #[tokio::test]
    async fn rejects_cross_origin_redirects_when_enabled() {
        let app = Router::new().route(
            "/hop",
            get(|| async {
                (
                    axum::http::StatusCode::FOUND,
                    [("location", "https://elsewhere.example/")],
                )
            }),
        );
        let (base, _shutdown) = spawn_stub(app).await;

        let fetcher = SafeFetcher::new(FetchPolicy::insecure());
        let err = fetcher
            .get(
                &format!("{base}/hop"),
                &FetchOptions {
                    allow_redirects: true,
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::CrossOriginRedirect));
    }

    #[tokio::test]
    async fn deadline_covers_slow_bodies() {
        let app = Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let (base, _shutdown) = spawn_stub(app).await;

        let fetcher = SafeFetcher::new(FetchPolicy::insecure());
        let err = fetcher
            .get(
                &format!("{base}/slow"),
                &FetchOptions {
                    timeout: Duration::from_millis(200),
                    ..FetchOptions::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout));
    }
}
