/// These tests drive the proxy through Rocket's local client. The upstream file server is a
/// tiny HTTP responder bound to a random local port, which records every request it receives.
#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use common::{CredentialCipher, AUTH_COOKIE_NAME};
    use proxy::config::ProxyConfig;
    use proxy::init_server;
    use proxy::server::{ErrorResponse, LoginRequest, LoginResponse, OkResponse, ScanResponse, UploadResponse};
    use rand::distributions::{Alphanumeric, DistString};
    use rocket::data::ToByteUnit;
    use rocket::http::{ContentType, Cookie, Header, Status};
    use rocket::local::asynchronous::{Client, LocalResponse};
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    const SECRET: &str = "integration-test-secret";

    const LISTING: &str = r#"{"dirs":[{"lead":"-","href":"docs/","sz":0,"ext":"---","ts":1700000000,"tags":{}}],"files":[],"taglist":[],"srvinf":"","acct":"ed","perms":["read","write","delete"],"cfg":{},"logues":[],"readmes":[]}"#;

    /// A request as seen by the mock upstream.
    #[derive(Debug, Clone)]
    struct Recorded {
        request_line: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    impl Recorded {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    struct MockUpstream {
        url: String,
        recorded: Arc<Mutex<Vec<Recorded>>>,
    }

    impl MockUpstream {
        /// Answer every request with the same canned response.
        async fn start(status: u16, content_type: Option<&'static str>, body: &'static str) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let recorded = Arc::new(Mutex::new(Vec::new()));
            let log = recorded.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let log = log.clone();
                    tokio::spawn(async move {
                        let _ = serve(stream, log, status, content_type, body).await;
                    });
                }
            });
            MockUpstream { url, recorded }
        }

        fn requests(&self) -> Vec<Recorded> {
            self.recorded.lock().unwrap().clone()
        }
    }

    fn reason(status: u16) -> &'static str {
        match status {
            200 => "OK",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            _ => "Internal Server Error",
        }
    }

    async fn serve(
        stream: TcpStream,
        log: Arc<Mutex<Vec<Recorded>>>,
        status: u16,
        content_type: Option<&'static str>,
        body: &'static str,
    ) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).await?;
        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }
        let length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or(0);
        let mut payload = vec![0; length];
        reader.read_exact(&mut payload).await?;
        log.lock().unwrap().push(Recorded {
            request_line: request_line.trim_end().to_string(),
            headers,
            body: payload,
        });

        let mut response = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            status,
            reason(status),
            body.len()
        );
        if let Some(content_type) = content_type {
            response.push_str(&format!("Content-Type: {}\r\n", content_type));
        }
        response.push_str("\r\n");
        response.push_str(body);
        let mut stream = reader.into_inner();
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }

    /// Create a random string of `len` characters.
    fn create_random_string(len: usize) -> String {
        Alphanumeric.sample_string(&mut rand::thread_rng(), len)
    }

    async fn client() -> Client {
        // Initialise the logger for testing.
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ProxyConfig {
            cookie_secret: Some(SECRET.to_string()),
            ..ProxyConfig::default()
        };
        Client::tracked(init_server(rocket::Config::figment(), config))
            .await
            .expect("valid rocket instance")
    }

    /// A session cookie sealed with the server secret.
    fn session_cookie(password: &str) -> Cookie<'static> {
        let token = CredentialCipher::new(SECRET).encrypt(password).unwrap();
        Cookie::new(AUTH_COOKIE_NAME, token)
    }

    fn action_uri(op: &str, server_url: &str, path: &str) -> String {
        format!(
            "/api/action?op={}&serverUrl={}&path={}",
            op,
            urlencoding::encode(server_url),
            urlencoding::encode(path)
        )
    }

    async fn login<'c>(client: &'c Client, server_url: &str, password: &str) -> LocalResponse<'c> {
        client
            .post("/api/action?op=login")
            .header(ContentType::JSON)
            .body(
                serde_json::to_string(&LoginRequest {
                    server_url: Some(server_url.to_string()),
                    username: None,
                    password: Some(password.to_string()),
                })
                .unwrap(),
            )
            .dispatch()
            .await
    }

    fn assert_no_store(response: &LocalResponse<'_>) {
        assert_eq!(response.headers().get_one("Cache-Control"), Some("no-store"));
    }

    #[rocket::async_test]
    async fn ls_without_session_is_unauthorized() {
        let upstream = MockUpstream::start(200, Some("application/json"), LISTING).await;
        let client = client().await;
        let response = client
            .get(action_uri("ls", &upstream.url, "/"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert_no_store(&response);
        let error = response.into_json::<ErrorResponse>().await.expect("error envelope");
        assert!(!error.error.is_empty());
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn spoofed_internal_header_is_ignored() {
        let upstream = MockUpstream::start(200, Some("application/json"), LISTING).await;
        let client = client().await;
        let token = CredentialCipher::new(SECRET).encrypt("secret").unwrap();
        let response = client
            .get(action_uri("ls", &upstream.url, "/"))
            .header(Header::new("x-auth-cookie", token))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn public_ops_with_another_verb_are_gated() {
        let upstream = MockUpstream::start(200, Some("text/plain"), "content").await;
        let client = client().await;
        let token = CredentialCipher::new(SECRET).encrypt("secret").unwrap();
        let uri = action_uri("login", &upstream.url, "/file.txt");

        let response = client
            .get(uri.clone())
            .header(Header::new("x-auth-cookie", token.clone()))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let response = client
            .delete(uri)
            .header(Header::new("x-auth-cookie", token.clone()))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);

        let response = client
            .get(action_uri("logout", &upstream.url, "/file.txt"))
            .header(Header::new("x-auth-cookie", token))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn tampered_cookie_is_unauthorized() {
        let upstream = MockUpstream::start(200, Some("application/json"), LISTING).await;
        let client = client().await;
        let response = client
            .get(action_uri("ls", &upstream.url, "/"))
            .cookie(Cookie::new(AUTH_COOKIE_NAME, "bm90LWEtdG9rZW4="))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn login_then_list() {
        let upstream = MockUpstream::start(200, Some("application/json"), LISTING).await;
        let client = client().await;
        let password = create_random_string(24);

        let response = login(&client, &upstream.url, &password).await;
        assert_eq!(response.status(), Status::Ok);
        assert_no_store(&response);
        let set_cookie = response
            .headers()
            .get_one("Set-Cookie")
            .expect("session cookie")
            .to_string();
        assert!(set_cookie.starts_with(&format!("{}=", AUTH_COOKIE_NAME)));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("SameSite=Lax"));
        assert!(set_cookie.contains("Path=/"));
        assert!(!set_cookie.contains("Secure"));
        let token = response
            .cookies()
            .get(AUTH_COOKIE_NAME)
            .map(|cookie| cookie.value().to_string())
            .expect("session cookie");
        assert!(!token.contains(&password));
        assert_eq!(
            CredentialCipher::new(SECRET).decrypt(&token).as_deref(),
            Some(password.as_str())
        );
        let body = response.into_json::<LoginResponse>().await.unwrap();
        assert!(body.ok);
        assert_eq!(body.username.as_deref(), Some("ed"));

        let requests = upstream.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0].request_line,
            format!("GET /?ls&pw={} HTTP/1.1", password)
        );

        // The tracked client sends the cookie back.
        let response = client
            .get(action_uri("ls", &upstream.url, "/docs/"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_no_store(&response);
        let listing = response.into_json::<Value>().await.unwrap();
        assert_eq!(listing, serde_json::from_str::<Value>(LISTING).unwrap());
        assert_eq!(
            upstream.requests()[1].request_line,
            format!("GET /docs/?ls&pw={} HTTP/1.1", password)
        );
    }

    #[rocket::async_test]
    async fn login_echoes_the_submitted_username() {
        let upstream = MockUpstream::start(200, Some("text/html"), "<html></html>").await;
        let client = client().await;
        let response = client
            .post("/api/action?op=login")
            .header(ContentType::JSON)
            .body(
                json!({"serverUrl": upstream.url, "username": "alice", "password": "secret"})
                    .to_string(),
            )
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_json::<LoginResponse>().await.unwrap();
        assert_eq!(body.username.as_deref(), Some("alice"));
    }

    #[rocket::async_test]
    async fn login_failures_are_translated() {
        for (status, message) in [
            (401, "Authentication failed"),
            (403, "Access denied"),
            (500, "Connection failed"),
        ] {
            let upstream = MockUpstream::start(status, None, "nope").await;
            let client = client().await;
            let response = login(&client, &upstream.url, "secret").await;
            assert_eq!(response.status().code, status);
            assert!(response.headers().get_one("Set-Cookie").is_none());
            let error = response.into_json::<ErrorResponse>().await.unwrap();
            assert_eq!(error.error, message);
        }
    }

    #[rocket::async_test]
    async fn login_requires_server_and_password() {
        let upstream = MockUpstream::start(200, Some("application/json"), LISTING).await;
        let client = client().await;
        let response = client
            .post("/api/action?op=login")
            .header(ContentType::JSON)
            .body(json!({"serverUrl": upstream.url}).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Missing serverUrl or password");
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn login_to_an_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let client = client().await;
        let response = login(&client, &url, "secret").await;
        assert_eq!(response.status(), Status::InternalServerError);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Connection failed");
    }

    #[rocket::async_test]
    async fn forwarded_https_sets_the_secure_flag() {
        let upstream = MockUpstream::start(200, Some("application/json"), LISTING).await;
        let client = client().await;
        let response = client
            .post("/api/action?op=login")
            .header(ContentType::JSON)
            .header(Header::new("X-Forwarded-Proto", "https"))
            .body(json!({"serverUrl": upstream.url, "password": "secret"}).to_string())
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let set_cookie = response.headers().get_one("Set-Cookie").unwrap();
        assert!(set_cookie.contains("Secure"));
    }

    #[rocket::async_test]
    async fn missing_server_url_is_a_bad_request() {
        let client = client().await;
        let response = client
            .get("/api/action?op=ls&path=%2F")
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Missing serverUrl");
    }

    #[rocket::async_test]
    async fn text_listing_is_wrapped() {
        let upstream = MockUpstream::start(200, None, "plain listing").await;
        let client = client().await;
        let response = client
            .get(action_uri("ls", &upstream.url, "/"))
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_json::<Value>().await.unwrap();
        assert_eq!(body, json!({"data": "plain listing"}));
    }

    #[rocket::async_test]
    async fn upstream_errors_are_relayed() {
        let upstream = MockUpstream::start(404, Some("text/plain"), "missing").await;
        let client = client().await;
        let response = client
            .get(action_uri("ls", &upstream.url, "/gone/"))
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::NotFound);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Not Found");
    }

    #[rocket::async_test]
    async fn unreachable_upstream_is_a_server_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);
        let client = client().await;
        let response = client
            .get(action_uri("ls", &url, "/"))
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::InternalServerError);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Upstream unreachable");
    }

    #[rocket::async_test]
    async fn thumbnails_are_relayed_unmodified() {
        let upstream = MockUpstream::start(200, Some("image/jpeg"), "JPEGDATA").await;
        let client = client().await;
        let response = client
            .get(action_uri("file", &upstream.url, "/photos/a.jpg?th"))
            .cookie(session_cookie("p@ss"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_no_store(&response);
        assert_eq!(response.headers().get_one("Content-Type"), Some("image/jpeg"));
        assert_eq!(response.into_bytes().await.unwrap(), b"JPEGDATA");
        assert_eq!(
            upstream.requests()[0].request_line,
            "GET /photos/a.jpg?th&pw=p%40ss HTTP/1.1"
        );
    }

    #[rocket::async_test]
    async fn upload_forwards_the_multipart_body() {
        let upstream = MockUpstream::start(200, Some("text/plain"), "uploaded").await;
        let client = client().await;
        let form = "--XyZ\r\nContent-Disposition: form-data; name=\"f\"; filename=\"hello.txt\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n--XyZ--\r\n";
        let response = client
            .post(action_uri("upload", &upstream.url, "/docs/"))
            .cookie(session_cookie("secret"))
            .header(Header::new("Content-Type", "multipart/form-data; boundary=XyZ"))
            .body(form)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_json::<UploadResponse>().await.unwrap();
        assert!(body.ok);
        assert_eq!(body.response, "uploaded");

        let requests = upstream.requests();
        assert_eq!(requests[0].request_line, "POST /docs/?pw=secret HTTP/1.1");
        assert_eq!(requests[0].body, form.as_bytes());
        assert!(requests[0]
            .header("content-type")
            .is_some_and(|value| value.contains("boundary=XyZ")));
    }

    #[rocket::async_test]
    async fn upload_rejects_other_bodies_and_ops() {
        let upstream = MockUpstream::start(200, Some("text/plain"), "uploaded").await;
        let client = client().await;
        let response = client
            .post(action_uri("upload", &upstream.url, "/docs/"))
            .cookie(session_cookie("secret"))
            .header(ContentType::JSON)
            .body("{}")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);

        let response = client
            .post(action_uri("chmod", &upstream.url, "/docs/"))
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::BadRequest);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Unsupported POST operation");
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn uploads_over_the_limit_are_rejected() {
        let upstream = MockUpstream::start(200, Some("text/plain"), "uploaded").await;
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ProxyConfig {
            cookie_secret: Some(SECRET.to_string()),
            upload_limit: 64.bytes(),
            ..ProxyConfig::default()
        };
        let client = Client::tracked(init_server(rocket::Config::figment(), config))
            .await
            .expect("valid rocket instance");
        let form = format!(
            "--XyZ\r\nContent-Disposition: form-data; name=\"f\"; filename=\"big.bin\"\r\n\r\n{}\r\n--XyZ--\r\n",
            create_random_string(256)
        );
        let response = client
            .post(action_uri("upload", &upstream.url, "/docs/"))
            .cookie(session_cookie("secret"))
            .header(Header::new("Content-Type", "multipart/form-data; boundary=XyZ"))
            .body(form)
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::PayloadTooLarge);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert!(error.error.starts_with("Uploads are limited to"));
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn upload_without_session_is_unauthorized() {
        let upstream = MockUpstream::start(200, Some("text/plain"), "uploaded").await;
        let client = client().await;
        let response = client
            .post(action_uri("upload", &upstream.url, "/docs/"))
            .header(Header::new("Content-Type", "multipart/form-data; boundary=XyZ"))
            .body("--XyZ--\r\n")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert!(upstream.requests().is_empty());
    }

    #[rocket::async_test]
    async fn delete_a_path() {
        let upstream = MockUpstream::start(200, None, "").await;
        let client = client().await;
        let response = client
            .delete(action_uri("delete", &upstream.url, "/docs/a.txt"))
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert!(response.into_json::<OkResponse>().await.unwrap().ok);
        assert_eq!(
            upstream.requests()[0].request_line,
            "DELETE /docs/a.txt?pw=secret HTTP/1.1"
        );
    }

    #[rocket::async_test]
    async fn delete_refused_upstream() {
        let upstream = MockUpstream::start(403, None, "").await;
        let client = client().await;
        let response = client
            .delete(action_uri("delete", &upstream.url, "/docs/a.txt"))
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Forbidden");
    }

    #[rocket::async_test]
    async fn logout_clears_the_cookie() {
        let client = client().await;
        let response = client
            .delete("/api/action?op=logout")
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);
        assert_no_store(&response);
        let set_cookie = response.headers().get_one("Set-Cookie").unwrap().to_string();
        assert!(set_cookie.starts_with(&format!("{}=;", AUTH_COOKIE_NAME)));
        assert!(set_cookie.contains("1970"));
        assert!(response.into_json::<OkResponse>().await.unwrap().ok);

        // Logging out without a session works too.
        let response = client.delete("/api/action?op=logout").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
    }

    #[rocket::async_test]
    async fn cookie_secret_comes_from_the_environment() {
        const ENV_SECRET: &str = "secret-from-the-environment";
        std::env::set_var("COOKIE_SECRET", ENV_SECRET);
        let config = proxy::figment().extract::<ProxyConfig>().unwrap();
        assert_eq!(config.cookie_secret.as_deref(), Some(ENV_SECRET));

        let upstream = MockUpstream::start(200, Some("application/json"), LISTING).await;
        let client = Client::tracked(init_server(proxy::figment(), config))
            .await
            .expect("valid rocket instance");
        let token = CredentialCipher::new(ENV_SECRET).encrypt("secret").unwrap();
        let response = client
            .get(action_uri("ls", &upstream.url, "/"))
            .cookie(Cookie::new(AUTH_COOKIE_NAME, token))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Ok);

        // A cookie sealed with another secret doesn't open.
        let response = client
            .get(action_uri("ls", &upstream.url, "/"))
            .cookie(session_cookie("secret"))
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Unauthorized);
        assert_eq!(
            upstream.requests()[0].request_line,
            "GET /?ls&pw=secret HTTP/1.1"
        );
        assert_eq!(upstream.requests().len(), 1);
    }

    #[rocket::async_test]
    async fn scan_is_disabled_for_demo_targets() {
        let client = client().await;
        let response = client
            .get("/api/scan?serverUrl=demo%3A%2F%2Flocal")
            .dispatch()
            .await;
        assert_eq!(response.status(), Status::Forbidden);
        assert_no_store(&response);
        let error = response.into_json::<ErrorResponse>().await.unwrap();
        assert_eq!(error.error, "Network scanning is disabled in demo mode");
    }

    #[rocket::async_test]
    async fn scan_finds_a_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _ = env_logger::builder().is_test(true).try_init();
        let config = ProxyConfig {
            cookie_secret: Some(SECRET.to_string()),
            scan_port: port,
            ..ProxyConfig::default()
        };
        let client = Client::tracked(init_server(rocket::Config::figment(), config))
            .await
            .expect("valid rocket instance");
        let response = client.get("/api/scan").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_json::<ScanResponse>().await.unwrap();
        assert!(body.targets.contains(&"127.0.0.1".to_string()));
        let mut unique = body.targets.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), body.targets.len());
    }
}
