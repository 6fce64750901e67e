mod client;
mod error;
mod state;

use std::{
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{bail, Context};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use client::ProxyClient;
use common::{DirectoryListing, Entry, UploadStatus, UploadTask};
use error::ClientError;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::Value;
use state::ClientState;
use tokio::io::AsyncWriteExt;
use url::Url;

/// How long `put` waits for an uploaded file to show up in the listing.
const LISTED_TIMEOUT: Duration = Duration::from_secs(20);
const LISTED_POLL: Duration = Duration::from_millis(800);
/// How often the upload progress is read back into the task.
const PROGRESS_TICK: Duration = Duration::from_millis(100);
/// The port file servers are found on by `scan`.
const UPSTREAM_PORT: u16 = 3923;

#[derive(Debug, Subcommand)]
enum Command {
    /// Open a session on a file server.
    Login {
        /// The address of the file server, e.g. `http://192.168.1.20:3923`.
        server: String,
        #[arg(long)]
        username: Option<String>,
        #[arg(long, env = "COPYPARTY_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Close the session and forget the server.
    Logout,
    /// List a directory.
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Download a file, or its thumbnail.
    Get {
        path: String,
        #[arg(long)]
        thumbnail: bool,
        /// Where to write the file, `-` for stdout. Defaults to the file name.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Upload files into a directory.
    Put {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[arg(long, default_value = "/")]
        dir: String,
    },
    /// Delete a file or a directory.
    Rm { path: String },
    /// Look for file servers on the proxy's local networks.
    Scan,
    /// Show or forget the saved server.
    Server {
        #[command(subcommand)]
        action: ServerCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ServerCommand {
    Show,
    Clear,
}

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// The address of the proxy.
    #[arg(long, env = "COPYPARTY_PROXY", default_value = "http://127.0.0.1:8000", value_parser = Url::parse)]
    proxy: Url,

    /// The file server to use instead of the saved one.
    #[arg(long = "server", global = true)]
    server_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

fn format_time(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_entry(entry: &Entry, is_dir: bool) -> String {
    let (kind, size, name) = if is_dir {
        ("d", "-".to_string(), format!("{}/", entry.name()))
    } else {
        ("-", format_size(entry.sz), entry.name())
    };
    format!("{} {:>10}  {}  {}", kind, size, format_time(entry.ts), name)
}

/// Directories first, then files. Anything that isn't a directory listing is printed as is.
fn render_listing(listing: Value) -> Vec<String> {
    if let Some(text) = listing.get("data").and_then(Value::as_str) {
        return vec![text.to_string()];
    }
    match serde_json::from_value::<DirectoryListing>(listing.clone()) {
        Ok(listing) => {
            let flag = |allowed: bool, flag: char| if allowed { flag } else { '-' };
            let mut lines = vec![format!(
                "access: {}{}{}",
                flag(listing.can_read(), 'r'),
                flag(listing.can_write(), 'w'),
                flag(listing.can_delete(), 'd'),
            )];
            lines.extend(listing.dirs.iter().map(|entry| format_entry(entry, true)));
            lines.extend(listing.files.iter().map(|entry| format_entry(entry, false)));
            lines
        }
        Err(e) => {
            log::debug!("Not a directory listing: `{}`", e);
            vec![listing.to_string()]
        }
    }
}

/// Where `get` writes by default: the last path segment.
fn default_output(path: &str) -> PathBuf {
    let name = path
        .split('?')
        .next()
        .unwrap_or_default()
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("download");
    PathBuf::from(name)
}

/// Check the outcome of a call made with the saved session. A 401 ends the session like `logout` does,
/// a 403 only means the account can't do this.
fn checked<T>(state: &ClientState, result: Result<T, ClientError>) -> anyhow::Result<T> {
    match result {
        Err(e) if e.is_unauthorized() => {
            log::info!("The proxy ended the session, forgetting it and the server");
            state.clear_session();
            state.clear_server();
            Err(e).context("Authentication failed, log in again")
        }
        Err(e) if e.status() == Some(403) => Err(e).context("Access denied, your account lacks permissions"),
        result => Ok(result?),
    }
}

/// Check that the saved server still takes the session by listing its root.
/// A refusal forgets the server, any other failure leaves the state alone.
async fn restore(client: &ProxyClient, state: &ClientState) -> anyhow::Result<()> {
    match client.list("/").await {
        Ok(_) => Ok(()),
        Err(e) if e.is_refused() => {
            log::info!("The saved server refused the session, forgetting it");
            state.clear_server();
            if e.is_unauthorized() {
                state.clear_session();
            }
            Err(e).context("The saved session is no longer valid, log in again")
        }
        Err(e) => Err(e).context("Couldn't check the saved session"),
    }
}

async fn wait_until_listed(client: &ProxyClient, dir: &str, file_name: &str, timeout: Duration) -> bool {
    let started = tokio::time::Instant::now();
    while started.elapsed() < timeout {
        if let Ok(listing) = client.list(dir).await {
            if let Ok(listing) = serde_json::from_value::<DirectoryListing>(listing) {
                if listing.files.iter().any(|entry| entry.name() == file_name) {
                    return true;
                }
            }
        }
        tokio::time::sleep(LISTED_POLL).await;
    }
    false
}

/// Move the task up to the bytes sent so far. The bar shows the task.
fn record_progress(task: &mut UploadTask, sent: &AtomicU64, progress: &ProgressBar) {
    let sent = sent.load(Ordering::Relaxed);
    task.advance(sent.saturating_sub(task.transferred()));
    progress.set_position(task.transferred());
}

/// Upload `files` into `dir` one at a time. Stops at the first 401, the session is gone.
async fn put(
    client: &ProxyClient,
    files: Vec<PathBuf>,
    dir: &str,
    listed_timeout: Duration,
) -> Result<Vec<UploadTask>, ClientError> {
    let style = ProgressStyle::with_template("{msg:20} [{bar:30}] {bytes}/{total_bytes}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let mut tasks = Vec::new();
    for file in files {
        let size = tokio::fs::metadata(&file).await?.len();
        tasks.push(UploadTask::new(file, size));
    }
    for task in tasks.iter_mut() {
        let progress = ProgressBar::new(task.size())
            .with_style(style.clone())
            .with_message(task.file_name());
        task.start();
        let sent = Arc::new(AtomicU64::new(0));
        let file = task.clone();
        let upload = client.upload(dir, &file, sent.clone());
        tokio::pin!(upload);
        let mut ticker = tokio::time::interval(PROGRESS_TICK);
        let result = loop {
            tokio::select! {
                result = &mut upload => break result,
                _ = ticker.tick() => record_progress(task, &sent, &progress),
            }
        };
        record_progress(task, &sent, &progress);
        match result {
            Ok(response) => {
                log::debug!("Upload of `{}` answered `{}`", task.file_name(), response);
                if wait_until_listed(client, dir, &task.file_name(), listed_timeout).await {
                    task.succeed();
                } else {
                    task.fail("Uploaded but not listed yet");
                }
            }
            Err(e) if e.is_unauthorized() => {
                task.fail(e.to_string());
                progress.abandon();
                return Err(e);
            }
            Err(e) => task.fail(e.to_string()),
        }
        match task.status() {
            UploadStatus::Success => progress.finish(),
            _ => progress.abandon(),
        }
    }
    Ok(tasks)
}

/// Write a relayed file to `output`, `-` meaning stdout.
async fn save(mut response: reqwest::Response, output: PathBuf) -> anyhow::Result<()> {
    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = if output.as_os_str() == "-" {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(
            tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("Couldn't create `{}`", output.display()))?,
        )
    };
    let mut written = 0u64;
    while let Some(chunk) = response.chunk().await? {
        sink.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    sink.flush().await?;
    log::info!("Wrote {} to `{}`", format_size(written), output.display());
    Ok(())
}

/// A client on the saved session. A server taken from the saved preference is checked first.
async fn resume(proxy: Url, server_url: Option<String>, state: &ClientState) -> anyhow::Result<ProxyClient> {
    let from_saved = server_url.is_none();
    let Some(server) = server_url.or_else(|| state.server()) else {
        bail!("No server selected, run `login` first or pass `--server`");
    };
    let Some(token) = state.session() else {
        bail!("Not logged in, run `login` first");
    };
    let client = ProxyClient::new(proxy, server, Some(token))?;
    if from_saved {
        restore(&client, state).await?;
    }
    Ok(client)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let state = ClientState::open();
    match args.command {
        Command::Login {
            server,
            username,
            password,
        } => {
            let mut client = ProxyClient::new(args.proxy, server.trim(), None)?;
            let account = client.login(username.as_deref(), &password).await?;
            if let Some(token) = client.token() {
                state.save_session(token);
            }
            state.save_server(client.server_url());
            match account {
                Some(account) => println!("Logged in to {} as {}", client.server_url(), account),
                None => println!("Logged in to {}", client.server_url()),
            }
            Ok(())
        }
        Command::Logout => {
            let mut client = ProxyClient::new(args.proxy, "", state.session())?;
            let result = client.logout().await;
            state.clear_session();
            state.clear_server();
            result?;
            println!("Logged out");
            Ok(())
        }
        Command::Server { action } => {
            match action {
                ServerCommand::Show => match state.server() {
                    Some(server) => println!("{}", server),
                    None => println!("No saved server"),
                },
                ServerCommand::Clear => state.clear_server(),
            }
            Ok(())
        }
        Command::Scan => {
            let server = args.server_url.or_else(|| state.server()).unwrap_or_default();
            let client = ProxyClient::new(args.proxy, server, None)?;
            let targets = client.scan().await?;
            if targets.is_empty() {
                println!("No file server found");
            }
            for target in targets {
                println!("http://{}:{}", target, UPSTREAM_PORT);
            }
            Ok(())
        }
        Command::Ls { path } => {
            let client = resume(args.proxy, args.server_url, &state).await?;
            let listing = checked(&state, client.list(&path).await)?;
            for line in render_listing(listing) {
                println!("{}", line);
            }
            Ok(())
        }
        Command::Get {
            path,
            thumbnail,
            output,
        } => {
            let client = resume(args.proxy, args.server_url, &state).await?;
            let remote = if thumbnail {
                format!("{}?th", path)
            } else {
                path.clone()
            };
            let response = checked(&state, client.fetch(&remote).await)?;
            save(response, output.unwrap_or_else(|| default_output(&path))).await
        }
        Command::Put { files, dir } => {
            let client = resume(args.proxy, args.server_url, &state).await?;
            let tasks = checked(&state, put(&client, files, &dir, LISTED_TIMEOUT).await)?;
            let failed: Vec<&UploadTask> = tasks
                .iter()
                .filter(|task| task.status() == UploadStatus::Error)
                .collect();
            for task in &failed {
                eprintln!("{}: {}", task.file_name(), task.error().unwrap_or("failed"));
            }
            if !failed.is_empty() {
                bail!("{} of {} upload(s) failed", failed.len(), tasks.len());
            }
            Ok(())
        }
        Command::Rm { path } => {
            let client = resume(args.proxy, args.server_url, &state).await?;
            checked(&state, client.delete(&path).await)?;
            println!("Deleted {}", path);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let logger_env = env_logger::Env::new().filter_or("COPYPARTY_LOG", "warn");
    env_logger::Builder::from_env(logger_env).init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}
