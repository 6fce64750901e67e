pub mod config;
pub mod discovery;
pub mod server;
pub mod session;
pub mod upstream;

use config::ProxyConfig;
use rocket::{
    fairing::AdHoc,
    figment::{
        providers::{Env, Format, Toml},
        Figment,
    },
};
use rocket_cors::{AllowedOrigins, CorsOptions};
use session::AuthGate;
use upstream::Upstream;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// The figment of the proxy: Rocket's defaults, the `Proxy_Rocket.toml` file and the `COOKIE_SECRET` variable.
pub fn figment() -> Figment {
    rocket::Config::figment()
        // Load the configuration file for the proxy server.
        .merge(Toml::file("Proxy_Rocket.toml").nested())
        .merge(Env::raw().only(&["cookie_secret"]))
}

/// Initialise the Rocket server.
pub fn init_server_from_config() -> rocket::Rocket<rocket::Build> {
    let _ = env_logger::try_init().inspect_err(|e| log::warn!("error `{}`", e));

    let figment = figment();
    let config = figment
        .extract::<ProxyConfig>()
        .expect("valid proxy configuration");
    init_server(figment, config)
}

/// Initialise the Rocket server with an explicit configuration.
pub fn init_server(figment: Figment, mut config: ProxyConfig) -> rocket::Rocket<rocket::Build> {
    config.resolve_secure_cookies(figment.profile());
    let cipher = config.cipher();
    let upstream = Upstream::new().expect("A valid HTTP client for the upstream servers!");

    let cors = CorsOptions {
        allowed_origins: AllowedOrigins::some_exact(&config.allowed_origins),
        allow_credentials: true,
        ..Default::default()
    }
    .to_cors()
    .expect("The CORS configuration is invalid.");

    // Listings and auth results must never be cached, not even by the browser.
    let no_store = AdHoc::on_response("No-Store", |req, res| {
        Box::pin(async move {
            if req.uri().path().as_str().starts_with("/api/") {
                res.set_raw_header("Cache-Control", "no-store");
            }
        })
    });

    // Initialise the rocket server also mounting the swagger-ui.
    rocket::custom(figment)
        .attach(cors)
        .attach(AuthGate)
        .attach(no_store)
        .manage(cipher)
        .manage(upstream)
        .manage(config)
        .mount(
            "/",
            SwaggerUi::new("/swagger-ui/<_..>")
                .url("/api-docs/openapi.json", server::OpenApiDoc::openapi()),
        )
        .mount(
            "/",
            rocket::routes![
                server::openapi,
                server::get_action,
                server::login,
                server::upload,
                server::logout,
                server::delete_path,
                server::scan,
            ],
        )
        .register(
            "/",
            rocket::catchers![server::unauthorized, server::default_catcher],
        )
}
