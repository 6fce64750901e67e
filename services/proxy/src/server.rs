use common::{CredentialCipher, DirectoryListing};
use futures_util::TryStreamExt;
use rocket::{
    catch, delete,
    data::Data,
    get,
    http::{ContentType, CookieJar, Status},
    post,
    response::{self, Responder, Response},
    serde::json::Json,
    FromForm, Request, State,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::io::StreamReader;
use utoipa::{IntoParams, OpenApi, ToSchema};

use crate::{
    config::ProxyConfig,
    discovery,
    session::{clear_credential, save_credential, CookieSecurity, SessionToken},
    upstream::{Upstream, UpstreamError},
};

/// Documentation in OpenAPI format.
#[derive(OpenApi)]
#[openapi(
    paths(openapi, get_action, login, upload, logout, delete_path, scan),
    components(schemas(
        LoginRequest,
        LoginResponse,
        OkResponse,
        UploadResponse,
        ScanResponse,
        ErrorResponse,
    ))
)]
pub struct OpenApiDoc;

/// Return JSON version of an OpenAPI schema
#[utoipa::path(
    get,
    path = "/api-doc.json",
    responses(
        (status = 200, description = "OpenAPI document of this server")
    )
)]
#[get("/api-doc.json")]
pub fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(OpenApiDoc::openapi())
}

/// The error envelope of every failed operation.
#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub error: String,
}

/// Errors of the proxy operations, each rendered as an [`ErrorResponse`].
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{reason}")]
    Upstream { status: u16, reason: String },
    #[error("{0}")]
    Internal(String),
}

impl ActionError {
    pub fn status(&self) -> Status {
        match self {
            ActionError::BadRequest(_) => Status::BadRequest,
            ActionError::Unauthorized(_) => Status::Unauthorized,
            ActionError::Forbidden(_) => Status::Forbidden,
            ActionError::PayloadTooLarge(_) => Status::PayloadTooLarge,
            ActionError::Upstream { status, .. } if (100..600).contains(status) => {
                Status::new(*status)
            }
            ActionError::Upstream { .. } => Status::InternalServerError,
            ActionError::Internal(_) => Status::InternalServerError,
        }
    }
}

impl From<UpstreamError> for ActionError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::InvalidUrl(_) => ActionError::BadRequest("Invalid serverUrl".to_string()),
            UpstreamError::Status { status, reason } => ActionError::Upstream { status, reason },
            UpstreamError::Transport(_) => ActionError::Upstream {
                status: 500,
                reason: "Upstream unreachable".to_string(),
            },
        }
    }
}

impl<'r> Responder<'r, 'static> for ActionError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = self.status();
        if status.class().is_server_error() {
            log::error!("`{}` failed: `{}`", req.uri().path(), self);
        } else {
            log::debug!("`{}` rejected with {}: `{}`", req.uri().path(), status, self);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .respond_to(req)
    }
}

/// The query of `/api/action`.
#[derive(FromForm, Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct ActionQuery {
    /// The operation, `ls` when absent for `GET`.
    pub op: Option<String>,
    /// The address of the upstream server, e.g. `http://127.0.0.1:3923`.
    #[field(name = "serverUrl")]
    #[serde(rename = "serverUrl")]
    pub server_url: Option<String>,
    /// The path on the upstream server, `/` when absent.
    pub path: Option<String>,
}

impl ActionQuery {
    fn op(&self) -> Option<&str> {
        self.op.as_deref().filter(|op| !op.is_empty())
    }

    fn server_url(&self) -> Result<&str, ActionError> {
        self.server_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ActionError::BadRequest("Missing serverUrl".to_string()))
    }

    fn path(&self) -> &str {
        self.path
            .as_deref()
            .filter(|path| !path.is_empty())
            .unwrap_or("/")
    }
}

/// Recover the credential from the session token. A token that doesn't open counts as no session.
fn unlock(cipher: &CredentialCipher, token: &SessionToken) -> Result<String, ActionError> {
    cipher
        .decrypt(token.as_str())
        .ok_or_else(|| ActionError::Unauthorized("Unauthorized".to_string()))
}

/// An upstream response relayed as is: status, headers and streamed body.
pub struct Relayed(reqwest::Response);

/// Headers that describe the upstream connection rather than the resource.
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "set-cookie",
];

impl<'r, 'o: 'r> Responder<'r, 'o> for Relayed {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'o> {
        let upstream = self.0;
        let mut builder = Response::build();
        builder.status(Status::new(upstream.status().as_u16()));
        for (name, value) in upstream.headers() {
            if SKIPPED_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                builder.raw_header_adjoin(name.as_str().to_string(), value.to_string());
            }
        }
        let body = upstream
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.without_url()));
        builder.streamed_body(StreamReader::new(body));
        Ok(builder.finalize())
    }
}

#[derive(Responder)]
pub enum ActionResponse {
    Listing(Json<Value>),
    Relayed(Relayed),
}

/// List a directory (`op=ls`, the default) or fetch any other resource (thumbnails, downloads).
#[utoipa::path(
    get,
    path = "/api/action",
    params(ActionQuery),
    responses(
        (status = 200, description = "The listing, or the relayed resource for other operations."),
        (status = 400, description = "Missing or invalid serverUrl.", body = ErrorResponse),
        (status = 401, description = "No session, or the session cookie doesn't decrypt.", body = ErrorResponse),
    )
)]
#[get("/api/action?<query..>")]
pub async fn get_action(
    token: SessionToken,
    query: ActionQuery,
    cipher: &State<CredentialCipher>,
    upstream: &State<Upstream>,
) -> Result<ActionResponse, ActionError> {
    let server_url = query.server_url()?;
    let credential = unlock(cipher, &token)?;
    match query.op().unwrap_or("ls") {
        "ls" => {
            let listing = upstream.list(server_url, query.path(), &credential).await?;
            Ok(ActionResponse::Listing(Json(listing.into_json())))
        }
        op => {
            log::debug!("Relaying `{}` for op `{}`", query.path(), op);
            let response = upstream.fetch(server_url, query.path(), &credential).await?;
            Ok(ActionResponse::Relayed(Relayed(response)))
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct LoginRequest {
    /// The address of the upstream server.
    #[serde(rename = "serverUrl")]
    pub server_url: Option<String>,
    /// Echoed back, the account reported by the server is used when absent.
    pub username: Option<String>,
    /// The upstream access password.
    pub password: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct LoginResponse {
    pub ok: bool,
    pub username: Option<String>,
}

/// Check the password against the upstream server and open a session.
#[utoipa::path(
    post,
    path = "/api/action?op=login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Session opened, the cookie is set.", body = LoginResponse),
        (status = 400, description = "Missing serverUrl or password.", body = ErrorResponse),
        (status = 401, description = "Authentication failed.", body = ErrorResponse),
        (status = 403, description = "Access denied.", body = ErrorResponse),
    )
)]
#[post("/api/action?op=login", data = "<request>", rank = 1)]
pub async fn login(
    request: Json<LoginRequest>,
    jar: &CookieJar<'_>,
    security: CookieSecurity,
    cipher: &State<CredentialCipher>,
    upstream: &State<Upstream>,
) -> Result<Json<LoginResponse>, ActionError> {
    let LoginRequest {
        server_url,
        username,
        password,
    } = request.into_inner();
    let (server_url, password) = match (
        server_url.filter(|url| !url.trim().is_empty()),
        password.filter(|pw| !pw.is_empty()),
    ) {
        (Some(server_url), Some(password)) => (server_url, password),
        _ => {
            return Err(ActionError::BadRequest(
                "Missing serverUrl or password".to_string(),
            ))
        }
    };
    let listing = match upstream.list(&server_url, "/", &password).await {
        Ok(listing) => listing,
        Err(UpstreamError::Status { status, .. }) => {
            log::info!("Login to `{}` refused with status {}", server_url, status);
            return Err(match status {
                401 => ActionError::Unauthorized("Authentication failed".to_string()),
                403 => ActionError::Forbidden("Access denied".to_string()),
                status => ActionError::Upstream {
                    status,
                    reason: "Connection failed".to_string(),
                },
            });
        }
        Err(UpstreamError::Transport(_)) => {
            return Err(ActionError::Upstream {
                status: 500,
                reason: "Connection failed".to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };
    let token = cipher.encrypt(&password).map_err(|e| {
        log::error!("Couldn't seal the session cookie: `{}`", e);
        ActionError::Internal("Couldn't open a session".to_string())
    })?;
    save_credential(jar, token, security);
    let username = username.filter(|name| !name.is_empty()).or_else(|| {
        serde_json::from_value::<DirectoryListing>(listing.into_json())
            .ok()
            .and_then(|listing| listing.account().map(str::to_string))
    });
    log::info!("Opened a session for `{}`", server_url);
    Ok(Json(LoginResponse { ok: true, username }))
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct UploadResponse {
    pub ok: bool,
    /// The text the upstream server answered.
    pub response: String,
}

/// Forward a multipart upload to `path`.
#[utoipa::path(
    post,
    path = "/api/action",
    params(ActionQuery),
    request_body(content = String, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Uploaded.", body = UploadResponse),
        (status = 400, description = "Missing serverUrl, unsupported operation or not a multipart body.", body = ErrorResponse),
        (status = 401, description = "No session, or the session cookie doesn't decrypt.", body = ErrorResponse),
        (status = 413, description = "The body exceeds the upload limit.", body = ErrorResponse),
    )
)]
#[post("/api/action?<query..>", data = "<body>", rank = 2)]
pub async fn upload(
    token: SessionToken,
    query: ActionQuery,
    content_type: Option<&ContentType>,
    body: Data<'_>,
    cipher: &State<CredentialCipher>,
    upstream: &State<Upstream>,
    config: &State<ProxyConfig>,
) -> Result<Json<UploadResponse>, ActionError> {
    if query.op().unwrap_or("upload") != "upload" {
        return Err(ActionError::BadRequest(
            "Unsupported POST operation".to_string(),
        ));
    }
    let server_url = query.server_url()?;
    let credential = unlock(cipher, &token)?;
    let content_type = content_type
        .filter(|content_type| content_type.is_form_data())
        .ok_or_else(|| ActionError::BadRequest("Expected a multipart form body".to_string()))?;
    let form = body.open(config.upload_limit).into_bytes().await.map_err(|e| {
        log::debug!("Couldn't read the upload body: `{}`", e);
        ActionError::BadRequest("Couldn't read the upload body".to_string())
    })?;
    if !form.is_complete() {
        return Err(ActionError::PayloadTooLarge(format!(
            "Uploads are limited to {}",
            config.upload_limit
        )));
    }
    log::debug!("Uploading {} bytes to `{}`", form.len(), query.path());
    let response = upstream
        .upload(
            server_url,
            query.path(),
            &credential,
            &content_type.to_string(),
            form.into_inner(),
        )
        .await?;
    Ok(Json(UploadResponse { ok: true, response }))
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct OkResponse {
    pub ok: bool,
}

/// Close the session. Always succeeds.
#[utoipa::path(
    delete,
    path = "/api/action?op=logout",
    responses(
        (status = 200, description = "The session cookie is cleared.", body = OkResponse),
    )
)]
#[delete("/api/action?op=logout", rank = 1)]
pub fn logout(jar: &CookieJar<'_>, security: CookieSecurity) -> Json<OkResponse> {
    clear_credential(jar, security);
    log::info!("Closed a session");
    Json(OkResponse { ok: true })
}

/// Delete `path` on the upstream server.
#[utoipa::path(
    delete,
    path = "/api/action",
    params(ActionQuery),
    responses(
        (status = 200, description = "Deleted.", body = OkResponse),
        (status = 400, description = "Missing or invalid serverUrl.", body = ErrorResponse),
        (status = 401, description = "No session, or the session cookie doesn't decrypt.", body = ErrorResponse),
    )
)]
#[delete("/api/action?<query..>", rank = 2)]
pub async fn delete_path(
    token: SessionToken,
    query: ActionQuery,
    cipher: &State<CredentialCipher>,
    upstream: &State<Upstream>,
) -> Result<Json<OkResponse>, ActionError> {
    let server_url = query.server_url()?;
    let credential = unlock(cipher, &token)?;
    upstream.delete(server_url, query.path(), &credential).await?;
    Ok(Json(OkResponse { ok: true }))
}

/// The query of `/api/scan`.
#[derive(FromForm, Deserialize, IntoParams, Debug, Default)]
#[into_params(parameter_in = Query)]
pub struct ScanQuery {
    /// The server the UI currently targets, only checked against demo targets.
    #[field(name = "serverUrl")]
    #[serde(rename = "serverUrl")]
    pub server_url: Option<String>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ScanResponse {
    pub targets: Vec<String>,
}

/// Probe the local /24 networks for file servers.
#[utoipa::path(
    get,
    path = "/api/scan",
    params(ScanQuery),
    responses(
        (status = 200, description = "Addresses that accepted a connection.", body = ScanResponse),
        (status = 403, description = "Scanning is disabled for demo targets.", body = ErrorResponse),
        (status = 500, description = "The local interfaces couldn't be enumerated.", body = ErrorResponse),
    )
)]
#[get("/api/scan?<query..>")]
pub async fn scan(
    query: ScanQuery,
    config: &State<ProxyConfig>,
) -> Result<Json<ScanResponse>, ActionError> {
    if query
        .server_url
        .as_deref()
        .is_some_and(discovery::is_demo_target)
    {
        return Err(ActionError::Forbidden(
            "Network scanning is disabled in demo mode".to_string(),
        ));
    }
    let found = discovery::scan(config.scan_settings()).await.map_err(|e| {
        log::error!("Scan error: `{}`", e);
        ActionError::Internal("Failed to scan networks".to_string())
    })?;
    Ok(Json(ScanResponse {
        targets: found.iter().map(ToString::to_string).collect(),
    }))
}

#[catch(401)]
pub fn unauthorized() -> (Status, Json<ErrorResponse>) {
    (
        Status::Unauthorized,
        Json(ErrorResponse {
            error: "Unauthorized: missing auth cookie".to_string(),
        }),
    )
}

#[catch(default)]
pub fn default_catcher(status: Status, _: &Request<'_>) -> (Status, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: status.reason().unwrap_or("Error").to_string(),
        }),
    )
}
