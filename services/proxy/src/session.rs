use common::AUTH_COOKIE_NAME;
use rocket::{
    fairing::{Fairing, Info, Kind},
    http::{Cookie, CookieJar, Header, Method, SameSite, Status},
    request::{FromRequest, Outcome},
    time::{Duration, OffsetDateTime},
    Data, Request,
};

use crate::config::ProxyConfig;

/// Internal header through which the gate hands the encrypted cookie to the handlers.
pub const AUTH_HEADER: &str = "x-auth-cookie";
/// Lifetime of a session cookie.
pub const SESSION_HOURS: i64 = 8;
/// The path guarded by the [`AuthGate`].
pub const ACTION_PATH: &str = "/api/action";

/// The two routes that must work without a session: `POST op=login` and `DELETE op=logout`.
/// The op alone isn't enough, other verbs with the same op reach the guarded routes.
fn is_public_op(method: Method, op: Option<&str>) -> bool {
    matches!(
        (method, op),
        (Method::Post, Some("login")) | (Method::Delete, Some("logout"))
    )
}

/// Request fairing in front of the proxy operations.
///
/// It copies the session cookie into [`AUTH_HEADER`] and blanks that header when there is no cookie,
/// so that clients cannot supply it themselves. The presence check happens in the [`SessionToken`] guard,
/// decryption in the handlers.
pub struct AuthGate;

#[rocket::async_trait]
impl Fairing for AuthGate {
    fn info(&self) -> Info {
        Info {
            name: "Auth Gate",
            kind: Kind::Request,
        }
    }

    async fn on_request(&self, req: &mut Request<'_>, _: &mut Data<'_>) {
        if !req.uri().path().as_str().starts_with(ACTION_PATH) {
            return;
        }
        let op = req.query_value::<&str>("op").and_then(Result::ok);
        if is_public_op(req.method(), op) {
            log::debug!("Auth gate: `{} {:?}` doesn't need a session", req.method(), op);
            return;
        }
        let token = req
            .cookies()
            .get(AUTH_COOKIE_NAME)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty());
        log::debug!(
            "Auth gate: `{}` request, session cookie present: {}",
            req.method(),
            token.is_some()
        );
        req.replace_header(Header::new(AUTH_HEADER, token.unwrap_or_default()));
    }
}

/// The encrypted session token of the request, still sealed.
/// Fails with [`Status::Unauthorized`] when neither the internal header nor the cookie carries one.
#[derive(Debug)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug)]
pub enum SessionError {
    Missing,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for SessionToken {
    type Error = SessionError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match read_credential(req) {
            Some(token) => Outcome::Success(SessionToken(token)),
            None => {
                log::debug!("No session token, rejecting `{}` before any upstream call", req.uri());
                Outcome::Error((Status::Unauthorized, SessionError::Missing))
            }
        }
    }
}

/// The sealed token: the internal header wins over the raw cookie.
pub fn read_credential(req: &Request<'_>) -> Option<String> {
    req.headers()
        .get_one(AUTH_HEADER)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            req.cookies()
                .get(AUTH_COOKIE_NAME)
                .map(|cookie| cookie.value().to_string())
                .filter(|value| !value.is_empty())
        })
}

/// Whether cookies set on this request get the `Secure` attribute:
/// `X-Forwarded-Proto` when present, the deployment setting otherwise.
#[derive(Debug, Clone, Copy)]
pub struct CookieSecurity(pub bool);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for CookieSecurity {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let fallback = req
            .rocket()
            .state::<ProxyConfig>()
            .and_then(|config| config.secure_cookies)
            .unwrap_or(false);
        Outcome::Success(CookieSecurity(is_secure(
            req.headers().get_one("x-forwarded-proto"),
            fallback,
        )))
    }
}

fn is_secure(forwarded_proto: Option<&str>, fallback: bool) -> bool {
    match forwarded_proto {
        Some(proto) => proto
            .split(',')
            .next()
            .map(|first| first.trim().eq_ignore_ascii_case("https"))
            .unwrap_or(false),
        None => fallback,
    }
}

/// Store the sealed credential in the session cookie.
pub fn save_credential(jar: &CookieJar<'_>, token: String, security: CookieSecurity) {
    jar.add(
        Cookie::build((AUTH_COOKIE_NAME, token))
            .http_only(true)
            .secure(security.0)
            .same_site(SameSite::Lax)
            .path("/")
            .expires(OffsetDateTime::now_utc() + Duration::hours(SESSION_HOURS)),
    );
}

/// Overwrite the session cookie with an empty, already expired one.
pub fn clear_credential(jar: &CookieJar<'_>, security: CookieSecurity) {
    jar.add(
        Cookie::build((AUTH_COOKIE_NAME, ""))
            .http_only(true)
            .secure(security.0)
            .same_site(SameSite::Lax)
            .path("/")
            .expires(OffsetDateTime::UNIX_EPOCH),
    );
}
