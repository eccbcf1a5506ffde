//! `reqwest` transport for the DigitalOcean API.

use std::time::Duration;

use reqwest::Url;

use super::{ApiError, ApiRequest, ApiResponse, Method, Transport, TransportFuture};

/// Base URL used when no override is configured.
pub const DEFAULT_API_BASE: &str = "https://api.digitalocean.com/";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("dropsmith/", env!("CARGO_PKG_VERSION"));

/// Sends requests over HTTPS with bearer-token authentication.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    token: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base", &self.base.as_str())
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Creates a transport for `token`, optionally against a compatible API
    /// at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::InvalidBaseUrl`] when `base_url` cannot be parsed,
    /// or [`ApiError::Transport`] when the HTTP client cannot be built.
    pub fn new(token: impl Into<String>, base_url: Option<&str>) -> Result<Self, ApiError> {
        let base = parse_base_url(base_url.unwrap_or(DEFAULT_API_BASE))?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| ApiError::Transport {
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base,
            token: token.into(),
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::InvalidBaseUrl {
                url: format!("{}{path}", self.base),
                message: err.to_string(),
            })
    }
}

/// Parses `raw`, forcing a trailing slash so relative joins keep any path
/// prefix of a compatible API.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, ApiError> {
    let trimmed = raw.trim();
    let normalised = if trimmed.ends_with('/') {
        trimmed.to_owned()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&normalised).map_err(|err| ApiError::InvalidBaseUrl {
        url: raw.to_owned(),
        message: err.to_string(),
    })?;
    if url.cannot_be_a_base() {
        return Err(ApiError::InvalidBaseUrl {
            url: raw.to_owned(),
            message: String::from("URL cannot be used as a base"),
        });
    }
    Ok(url)
}

const fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Delete => reqwest::Method::DELETE,
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, request: &'a ApiRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            let url = self.url_for(&request.path)?;
            let mut builder = self
                .client
                .request(reqwest_method(request.method), url)
                .bearer_auth(&self.token);
            if !request.query.is_empty() {
                builder = builder.query(&request.query);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|err| ApiError::Transport {
                message: err.to_string(),
            })?;
            let status = response.status().as_u16();
            let body = response.bytes().await.map_err(|err| ApiError::Transport {
                message: err.to_string(),
            })?;

            Ok(ApiResponse {
                status,
                body: body.to_vec(),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[rstest]
    #[case("https://api.digitalocean.com", "https://api.digitalocean.com/")]
    #[case("https://example.test/compat/", "https://example.test/compat/")]
    #[case("https://example.test/compat", "https://example.test/compat/")]
    fn parse_base_url_normalises_trailing_slash(#[case] raw: &str, #[case] expected: &str) {
        let url = parse_base_url(raw).unwrap_or_else(|err| panic!("parse {raw}: {err}"));
        assert_eq!(url.as_str(), expected);
    }

    #[test]
    fn parse_base_url_rejects_garbage() {
        let err = parse_base_url("not a url").expect_err("garbage should fail");
        assert!(matches!(err, ApiError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn debug_output_hides_token() {
        let transport = HttpTransport::new("very-secret", None)
            .unwrap_or_else(|err| panic!("transport: {err}"));
        let rendered = format!("{transport:?}");
        assert!(!rendered.contains("very-secret"), "rendered: {rendered}");
    }

    #[tokio::test]
    async fn send_attaches_bearer_token_and_reads_body() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap_or_else(|err| panic!("bind listener: {err}"));
        let addr = listener
            .local_addr()
            .unwrap_or_else(|err| panic!("listener addr: {err}"));

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener
                .accept()
                .await
                .unwrap_or_else(|err| panic!("accept: {err}"));
            let mut request = Vec::new();
            let mut buf = [0_u8; 1024];
            while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                let read = stream
                    .read(&mut buf)
                    .await
                    .unwrap_or_else(|err| panic!("read: {err}"));
                if read == 0 {
                    break;
                }
                request.extend_from_slice(buf.get(..read).unwrap_or_default());
            }
            let body = r#"{"regions":[]}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            stream
                .write_all(response.as_bytes())
                .await
                .unwrap_or_else(|err| panic!("write: {err}"));
            String::from_utf8_lossy(&request).to_lowercase()
        });

        let transport = HttpTransport::new("tok-123", Some(&format!("http://{addr}")))
            .unwrap_or_else(|err| panic!("transport: {err}"));
        let request = ApiRequest::get("v2/regions").with_query("per_page", "200");
        let response = transport
            .send(&request)
            .await
            .unwrap_or_else(|err| panic!("send: {err}"));

        assert_eq!(response.status, 200);
        assert_eq!(response.body, br#"{"regions":[]}"#.to_vec());

        let seen = server
            .await
            .unwrap_or_else(|err| panic!("server task: {err}"));
        assert!(seen.starts_with("get /v2/regions?per_page=200 "), "request: {seen}");
        assert!(seen.contains("authorization: bearer tok-123"), "request: {seen}");
    }
}
