use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use common::{UploadTask, AUTH_COOKIE_NAME};
use futures_util::TryStreamExt;
use reqwest::{header, multipart, Body, Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::error::{ClientError, Result};

#[derive(Serialize)]
struct LoginRequest<'a> {
    #[serde(rename = "serverUrl")]
    server_url: &'a str,
    username: Option<&'a str>,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    username: Option<String>,
}

#[derive(Deserialize)]
struct UploadResponse {
    response: String,
}

#[derive(Deserialize)]
struct ScanResponse {
    targets: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// The session cookie value from the `Set-Cookie` headers, if the response opened a session.
pub fn session_token(headers: &header::HeaderMap) -> Option<String> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == AUTH_COOKIE_NAME)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Turn a non-success response into a [`ClientError::Status`] carrying the proxy's error message.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("Error").to_string(),
    };
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}

/// Client of the proxy for one upstream server.
#[derive(Debug)]
pub struct ProxyClient {
    http: Client,
    proxy: Url,
    server_url: String,
    token: Option<String>,
}

impl ProxyClient {
    pub fn new(proxy: Url, server_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("copyparty-cli/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(ProxyClient {
            http,
            proxy,
            server_url: server_url.into(),
            token,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// `/api/action` with the operation, the server and the path.
    fn action_url(&self, op: &str, path: Option<&str>) -> Result<Url> {
        let mut url = self.proxy.join("/api/action")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("op", op);
            if op != "login" && op != "logout" {
                query.append_pair("serverUrl", &self.server_url);
            }
            if let Some(path) = path {
                query.append_pair("path", path);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.header(header::COOKIE, format!("{}={}", AUTH_COOKIE_NAME, token)),
            None => request,
        }
    }

    /// Open a session. Returns the account name, as submitted or as reported by the server.
    pub async fn login(&mut self, username: Option<&str>, password: &str) -> Result<Option<String>> {
        let url = self.action_url("login", None)?;
        let response = self
            .request(Method::POST, url)
            .json(&LoginRequest {
                server_url: &self.server_url,
                username,
                password,
            })
            .send()
            .await?;
        let response = check(response).await?;
        self.token = Some(session_token(response.headers()).ok_or(ClientError::NoCookie)?);
        let body = response.json::<LoginResponse>().await?;
        Ok(body.username)
    }

    pub async fn logout(&mut self) -> Result<()> {
        let url = self.action_url("logout", None)?;
        check(self.request(Method::DELETE, url).send().await?).await?;
        self.token = None;
        Ok(())
    }

    /// The listing of `path`: the server's JSON, or `{ "data": text }`.
    pub async fn list(&self, path: &str) -> Result<Value> {
        let url = self.action_url("ls", Some(path))?;
        let response = check(self.request(Method::GET, url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// A file or a thumbnail, as relayed by the proxy.
    pub async fn fetch(&self, path: &str) -> Result<Response> {
        let url = self.action_url("file", Some(path))?;
        check(self.request(Method::GET, url).send().await?).await
    }

    /// Upload the task's file into `dir`, streaming it from disk. Every chunk read is added to `sent`.
    pub async fn upload(&self, dir: &str, task: &UploadTask, sent: Arc<AtomicU64>) -> Result<String> {
        let url = self.action_url("upload", Some(dir))?;
        let file = tokio::fs::File::open(task.source()).await?;
        let stream = ReaderStream::new(file).inspect_ok(move |chunk| {
            sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        });
        let part = multipart::Part::stream_with_length(Body::wrap_stream(stream), task.size())
            .file_name(task.file_name());
        let form = multipart::Form::new().part("f", part);
        let response = check(self.request(Method::POST, url).multipart(form).send().await?).await?;
        Ok(response.json::<UploadResponse>().await?.response)
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        let url = self.action_url("delete", Some(path))?;
        check(self.request(Method::DELETE, url).send().await?).await?;
        Ok(())
    }

    /// Addresses on the proxy's local networks that accept connections on the file server port.
    pub async fn scan(&self) -> Result<Vec<String>> {
        let mut url = self.proxy.join("/api/scan")?;
        if !self.server_url.is_empty() {
            url.query_pairs_mut().append_pair("serverUrl", &self.server_url);
        }
        let response = check(self.http.get(url).send().await?).await?;
        Ok(response.json::<ScanResponse>().await?.targets)
    }
}
