//! HTTP webhook notifier.
//!
//! Opens one connection per delivery: plain TCP for `http`, TCP wrapped in
//! rustls (Mozilla roots) for `https`. Any response status of 400 or above
//! counts as a failed delivery.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HOST, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;
use watchpost_core::config::WebhookConfig;

use crate::error::{NotifyError, NotifyResult};
use crate::notifier::{BoxFuture, Notifier, StatusEvent};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Delivers status events to an HTTP endpoint.
#[derive(Clone)]
pub struct WebhookNotifier {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl WebhookNotifier {
    /// A `GET` webhook with an empty body and the default timeout.
    pub fn new(url: &str) -> NotifyResult<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| NotifyError::Invalid(format!("url '{url}': {e}")))?;
        let tls = match uri.scheme_str() {
            Some("http") => None,
            Some("https") => Some(tls_connector()?),
            _ => {
                return Err(NotifyError::Invalid(format!(
                    "url '{url}' must use the http or https scheme"
                )));
            }
        };
        if uri.host().is_none_or(str::is_empty) {
            return Err(NotifyError::Invalid(format!("url '{url}' has no host")));
        }

        Ok(Self {
            method: Method::GET,
            uri,
            headers: HeaderMap::new(),
            body: String::new(),
            timeout: DEFAULT_TIMEOUT,
            tls,
        })
    }

    pub fn from_config(config: &WebhookConfig) -> NotifyResult<Self> {
        let timeout = config
            .timeout()
            .map_err(|e| NotifyError::Invalid(e.to_string()))?;
        let mut webhook = Self::new(&config.url)?
            .with_method(&config.method())?
            .with_body(&config.body)
            .with_timeout(timeout);
        for (name, value) in &config.headers {
            webhook = webhook.with_header(name, value)?;
        }
        Ok(webhook)
    }

    pub fn with_method(mut self, method: &str) -> NotifyResult<Self> {
        self.method = Method::from_bytes(method.as_bytes())
            .map_err(|e| NotifyError::Invalid(format!("method '{method}': {e}")))?;
        Ok(self)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> NotifyResult<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| NotifyError::Invalid(format!("header '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| NotifyError::Invalid(format!("header '{name}' value: {e}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Body template; `{status}`, `{group}` and `{name}` are substituted.
    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn render(&self, event: &StatusEvent) -> String {
        self.body
            .replace("{status}", event.status.as_str())
            .replace("{group}", &event.group)
            .replace("{name}", &event.name)
    }

    async fn deliver(&self, event: &StatusEvent) -> NotifyResult<()> {
        let host = self.uri.host().unwrap_or_default();
        let port = self
            .uri
            .port_u16()
            .unwrap_or(if self.tls.is_some() { 443 } else { 80 });

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| NotifyError::Connect {
                target: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;

        let status = match &self.tls {
            Some(tls) => {
                let server_name = rustls::pki_types::ServerName::try_from(host)
                    .map_err(|e| NotifyError::Tls(format!("invalid server name '{host}': {e}")))?
                    .to_owned();
                let stream = tls
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| NotifyError::Tls(e.to_string()))?;
                self.exchange(stream, event).await?
            }
            None => self.exchange(stream, event).await?,
        };

        if status.as_u16() >= 400 {
            return Err(NotifyError::Status(status.as_u16()));
        }
        debug!(url = %self.uri, %status, "webhook delivered");
        Ok(())
    }

    async fn exchange<S>(&self, stream: S, event: &StatusEvent) -> NotifyResult<http::StatusCode>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| NotifyError::Request(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let authority = self
            .uri
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();
        let path = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");

        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(path)
            .header(HOST, authority)
            .header(USER_AGENT, concat!("watchpost/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::from(self.render(event))))
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        request.headers_mut().extend(self.headers.clone());

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| NotifyError::Request(e.to_string()))?;
        let status = response.status();
        // The body is irrelevant, but reading it lets the connection finish.
        let _ = response.into_body().collect().await;
        Ok(status)
    }
}

impl Notifier for WebhookNotifier {
    fn execute<'a>(&'a self, event: &'a StatusEvent) -> BoxFuture<'a, NotifyResult<()>> {
        Box::pin(async move {
            tokio::time::timeout(self.timeout, self.deliver(event))
                .await
                .map_err(|_| NotifyError::Timeout(self.timeout))?
        })
    }

    fn describe(&self) -> String {
        format!("webhook {} {}", self.method, self.uri)
    }
}

fn tls_connector() -> NotifyResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(
        rustls::crypto::ring::default_provider().into(),
    )
    .with_safe_default_protocol_versions()
    .map_err(|e| NotifyError::Tls(format!("protocol versions: {e}")))?
    .with_root_certificates(roots)
    .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use watchpost_core::Status;

    /// Serve one request with `status`, handing the raw request back.
    async fn serve_once(status: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if request_complete(&raw) {
                    break;
                }
            }
            let response =
                format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&raw).into_owned());
        });

        (format!("http://{addr}/hooks/status?source=watchpost"), rx)
    }

    fn request_complete(raw: &[u8]) -> bool {
        let text = String::from_utf8_lossy(raw);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|l| {
                let (name, value) = l.split_once(':')?;
                name.eq_ignore_ascii_case("content-length")
                    .then(|| value.trim().parse::<usize>().ok())?
            })
            .unwrap_or(0);
        body.len() >= length
    }

    fn event() -> StatusEvent {
        StatusEvent::new(Status::Unhealthy, "api", "Website is up")
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(WebhookNotifier::new("ftp://example.com").is_err());
        assert!(WebhookNotifier::new("not a url").is_err());
        assert!(WebhookNotifier::new("http://").is_err());
        assert!(WebhookNotifier::new("https://hooks.example.com/x").is_ok());
    }

    #[test]
    fn renders_body_template() {
        let webhook = WebhookNotifier::new("http://localhost/")
            .unwrap()
            .with_body(r#"{"text":"{group}/{name} went {status}"}"#);
        assert_eq!(
            webhook.render(&event()),
            r#"{"text":"api/Website is up went unhealthy"}"#
        );
    }

    #[test]
    fn from_config_applies_method_and_headers() {
        let config = WebhookConfig {
            url: "http://localhost:9000/alert".to_string(),
            method: Some("post".to_string()),
            headers: [("x-token".to_string(), "secret".to_string())].into(),
            body: "{status}".to_string(),
            timeout: Some("5s".to_string()),
        };
        let webhook = WebhookNotifier::from_config(&config).unwrap();
        assert_eq!(webhook.method, Method::POST);
        assert_eq!(webhook.timeout, Duration::from_secs(5));
        assert_eq!(webhook.headers["x-token"], "secret");
        assert_eq!(webhook.describe(), "webhook POST http://localhost:9000/alert");
    }

    #[tokio::test]
    async fn delivers_rendered_request() {
        let (url, request) = serve_once("200 OK").await;
        let webhook = WebhookNotifier::new(&url)
            .unwrap()
            .with_method("POST")
            .unwrap()
            .with_header("content-type", "text/plain")
            .unwrap()
            .with_body("{group}/{name}: {status}");

        webhook.execute(&event()).await.unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("POST /hooks/status?source=watchpost HTTP/1.1\r\n"));
        assert!(request.to_lowercase().contains("content-type: text/plain"));
        assert!(request.ends_with("api/Website is up: unhealthy"));
    }

    #[tokio::test]
    async fn error_status_is_failure() {
        let (url, _request) = serve_once("500 Internal Server Error").await;
        let webhook = WebhookNotifier::new(&url).unwrap();
        let err = webhook.execute(&event()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status(500)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let webhook = WebhookNotifier::new(&format!("http://{addr}/"))
            .unwrap()
            .with_timeout(Duration::from_secs(2));
        let err = webhook.execute(&event()).await.unwrap_err();
        assert!(matches!(
            err,
            NotifyError::Connect { .. } | NotifyError::Timeout(_)
        ));
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let webhook = WebhookNotifier::new(&format!("http://{addr}/"))
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let err = webhook.execute(&event()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Timeout(_)));
    }
}
