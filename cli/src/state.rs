use std::path::{Path, PathBuf};

use common::{FileStore, KeyValueStore, ServerPreference};

/// Directory under the platform config directory holding the client state.
pub const STATE_DIR: &str = "copyparty-proxy";
const SESSION_KEY: &str = "session";

/// What the client remembers between runs: the server it works with and the sealed session cookie.
/// The two live in separate files and are cleared separately.
#[derive(Debug)]
pub struct ClientState {
    server: ServerPreference<FileStore>,
    session: FileStore,
}

impl ClientState {
    /// The state under the platform config directory, or the working directory when there is none.
    pub fn open() -> Self {
        let dir = dirs::config_dir()
            .map(|dir| dir.join(STATE_DIR))
            .unwrap_or_else(|| {
                log::warn!("No config directory on this platform, keeping the state in `.{}`", STATE_DIR);
                PathBuf::from(format!(".{}", STATE_DIR))
            });
        Self::in_dir(&dir)
    }

    pub fn in_dir(dir: &Path) -> Self {
        let session = FileStore::new(dir.join("session.json"));
        log::debug!("Client session in `{}`", session.path().display());
        ClientState {
            server: ServerPreference::new(FileStore::new(dir.join("server.json"))),
            session,
        }
    }

    pub fn server(&self) -> Option<String> {
        self.server.get()
    }

    pub fn save_server(&self, server_url: &str) {
        self.server.save(server_url)
    }

    pub fn clear_server(&self) {
        self.server.clear()
    }

    /// The sealed cookie value. The client can't open it, it only sends it back.
    pub fn session(&self) -> Option<String> {
        self.session
            .get(SESSION_KEY)
            .inspect_err(|e| log::warn!("Couldn't read the session: `{}`", e))
            .ok()
            .flatten()
            .filter(|token| !token.is_empty())
    }

    pub fn save_session(&self, token: &str) {
        if let Err(e) = self.session.set(SESSION_KEY, token) {
            log::warn!("Couldn't save the session: `{}`", e);
        }
    }

    pub fn clear_session(&self) {
        if let Err(e) = self.session.remove(SESSION_KEY) {
            log::warn!("Couldn't clear the session: `{}`", e);
        }
    }
}
