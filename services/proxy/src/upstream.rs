use reqwest::{header, Client, Method, Response, StatusCode};
use serde_json::{json, Value};
use url::Url;

/// Errors talking to the upstream file server.
/// None of them carries the credential, they are safe to log.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("invalid server address `{0}`")]
    InvalidUrl(String),
    #[error("upstream answered {status}: {reason}")]
    Status { status: u16, reason: String },
    #[error("upstream unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl UpstreamError {
    fn from_status(status: StatusCode) -> Self {
        UpstreamError::Status {
            status: status.as_u16(),
            reason: status
                .canonical_reason()
                .unwrap_or("Upstream error")
                .to_string(),
        }
    }
}

/// A listing body, either JSON or anything else the server sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Listing {
    Json(Value),
    Text(String),
}

impl Listing {
    /// The body relayed to the browser, text is wrapped as `{ "data": text }`.
    pub fn into_json(self) -> Value {
        match self {
            Listing::Json(value) => value,
            Listing::Text(text) => json!({ "data": text }),
        }
    }
}

/// Append a `key[=value]` pair to a URL string, with `?` or `&` as needed.
fn append_query(url: &mut String, pair: &str) {
    url.push(if url.contains('?') { '&' } else { '?' });
    url.push_str(pair);
}

/// Join the server address and the path into an upstream URL, without the credential.
pub fn resource_url(server_url: &str, path: &str, query: Option<&str>) -> Result<String, UpstreamError> {
    let base = server_url.trim().trim_end_matches('/');
    let parsed = Url::parse(base).map_err(|_| UpstreamError::InvalidUrl(server_url.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(UpstreamError::InvalidUrl(server_url.to_string()));
    }
    let mut url = base.to_string();
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if let Some(query) = query {
        append_query(&mut url, query);
    }
    Ok(url)
}

/// Append the credential as the `pw` query parameter.
fn with_credential(url: &str, credential: &str) -> Result<Url, UpstreamError> {
    let mut url = url.to_string();
    append_query(&mut url, &format!("pw={}", urlencoding::encode(credential)));
    Url::parse(&url).map_err(|_| UpstreamError::InvalidUrl(url_without_query(&url)))
}

fn url_without_query(url: &str) -> String {
    url.split('?').next().unwrap_or_default().to_string()
}

/// Whether the response declares a JSON body. A missing content type means text.
pub fn is_json(response_headers: &header::HeaderMap) -> bool {
    response_headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|media_type| media_type.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// Client of the upstream file server. Holds no credential: each call receives it.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
}

impl Upstream {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("proxy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Upstream { client })
    }

    async fn send(
        &self,
        method: Method,
        server_url: &str,
        path: &str,
        query: Option<&str>,
        credential: &str,
        body: Option<(&str, Vec<u8>)>,
    ) -> Result<Response, UpstreamError> {
        let url = resource_url(server_url, path, query)?;
        log::debug!("Forwarding {} `{}`", method, url);
        let mut request = self
            .client
            .request(method, with_credential(&url, credential)?);
        if let Some((content_type, body)) = body {
            request = request.header(header::CONTENT_TYPE, content_type).body(body);
        }
        request.send().await.map_err(|e| {
            // The error would otherwise print the URL, credential included.
            let e = e.without_url();
            log::error!("Couldn't reach the upstream server `{}`: `{}`", url, e);
            UpstreamError::Transport(e)
        })
    }

    /// `GET {path}?ls`.
    pub async fn list(
        &self,
        server_url: &str,
        path: &str,
        credential: &str,
    ) -> Result<Listing, UpstreamError> {
        let response = self
            .send(Method::GET, server_url, path, Some("ls"), credential, None)
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::from_status(response.status()));
        }
        let json = is_json(response.headers());
        let text = response.text().await.map_err(reqwest::Error::without_url)?;
        if json {
            match serde_json::from_str(&text) {
                Ok(value) => return Ok(Listing::Json(value)),
                Err(e) => log::debug!("Upstream listing labelled JSON doesn't parse: `{}`", e),
            }
        }
        Ok(Listing::Text(text))
    }

    /// `GET {path}`, whatever the outcome: the caller relays the response as is.
    pub async fn fetch(
        &self,
        server_url: &str,
        path: &str,
        credential: &str,
    ) -> Result<Response, UpstreamError> {
        self.send(Method::GET, server_url, path, None, credential, None)
            .await
    }

    /// `POST {path}` with a multipart body, returning the text the server answered.
    pub async fn upload(
        &self,
        server_url: &str,
        path: &str,
        credential: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, UpstreamError> {
        let response = self
            .send(
                Method::POST,
                server_url,
                path,
                None,
                credential,
                Some((content_type, body)),
            )
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::from_status(response.status()));
        }
        Ok(response.text().await.map_err(reqwest::Error::without_url)?)
    }

    /// `DELETE {path}`.
    pub async fn delete(
        &self,
        server_url: &str,
        path: &str,
        credential: &str,
    ) -> Result<(), UpstreamError> {
        let response = self
            .send(Method::DELETE, server_url, path, None, credential, None)
            .await?;
        if !response.status().is_success() {
            return Err(UpstreamError::from_status(response.status()));
        }
        Ok(())
    }
}
