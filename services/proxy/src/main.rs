/// The entry point of the proxy server.
/// Browsers talk to `/api/action` and `/api/scan`; the upstream password only travels
/// inside the encrypted `copyparty_auth` cookie.
#[rocket::launch]
fn rocket() -> _ {
    proxy::init_server_from_config()
}
