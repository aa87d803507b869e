//! Ephemeral PostgreSQL server lifecycle.
//!
//! Starts a throwaway server in a fresh temporary directory and guarantees
//! it is stopped again, either explicitly via [`EphemeralServer::stop`] or
//! on drop.
//!
//! # Example
//!
//! ```no_run
//! use pgtestdb::{with_server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::with_free_port()?;
//!     with_server(config, |config| async move {
//!         println!("server up at {}", config.admin_url());
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use tempfile::TempDir;
use tokio::process::Command;
use tracing::instrument;

use crate::conn::AdminConn;
use crate::scope;
use crate::{Error, Result, ServerConfig};

/// Non-durability overlay appended to `postgresql.conf` for tuned servers.
///
/// Data never outlives the test run, so crash safety buys nothing.
pub const TUNING_OVERLAY: &[(&str, &str)] = &[
    ("fsync", "off"),
    ("synchronous_commit", "off"),
    ("full_page_writes", "off"),
    ("autovacuum", "off"),
    ("checkpoint_timeout", "'1h'"),
    ("max_wal_size", "'4GB'"),
];

/// Distribution layouts searched when a binary is neither configured nor on PATH.
const SEARCH_PATTERNS: &[&str] = &[
    "/usr/lib/postgresql/*/bin",
    "/usr/pgsql-*/bin",
    "/usr/local/pgsql/bin",
    "/usr/local/opt/postgresql*/bin",
    "/opt/homebrew/opt/postgresql*/bin",
    "/opt/local/lib/postgresql*/bin",
];

/// Number of log lines attached to a start failure.
const LOG_TAIL_LINES: usize = 20;

/// A running ephemeral server.
///
/// Owns a temporary directory laid out as `data/` (the cluster),
/// `server.log` and the Unix socket. The server is stopped and the directory
/// removed when this handle is dropped, unless [`EphemeralServer::stop`]
/// already did so.
#[derive(Debug)]
pub struct EphemeralServer {
    config: ServerConfig,
    root: Option<TempDir>,
    root_path: PathBuf,
    data_dir: PathBuf,
    log_file: PathBuf,
    pg_ctl: PathBuf,
    running: AtomicBool,
}

impl EphemeralServer {
    /// Initializes a fresh cluster and starts a server on `config.port`.
    ///
    /// Fails if `initdb` or `pg_ctl start` fail; `pg_ctl start -w` only
    /// returns once the server accepts connections.
    #[instrument(
        name = "pgtestdb.server.start",
        skip_all,
        fields(port = config.port, host = %config.host),
        err
    )]
    pub async fn start(config: ServerConfig) -> Result<Self> {
        let initdb = find_binary("initdb", config.bin_dir.as_deref())?;
        let pg_ctl = find_binary("pg_ctl", config.bin_dir.as_deref())?;

        let root = tempfile::Builder::new()
            .prefix("pgtestdb-")
            .tempdir()
            .map_err(|source| Error::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        let root_path = root.path().to_path_buf();
        let data_dir = root_path.join("data");
        let log_file = root_path.join("server.log");

        tracing::info!(data_dir = %data_dir.display(), "initializing cluster");
        run_initdb(&initdb, &config, &root_path, &data_dir).await?;
        write_server_conf(&config, &root_path, &data_dir).await?;

        let server = Self {
            config,
            root: Some(root),
            root_path,
            data_dir,
            log_file,
            pg_ctl,
            // set before starting so a half-started postmaster is still stopped
            running: AtomicBool::new(true),
        };
        server.pg_ctl_start().await?;

        tracing::info!(
            port = server.config.port,
            log_file = %server.log_file.display(),
            "server ready"
        );
        Ok(server)
    }

    async fn pg_ctl_start(&self) -> Result<()> {
        let mut cmd = Command::new(&self.pg_ctl);
        cmd.arg("start")
            .arg("-w")
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-l")
            .arg(&self.log_file)
            .arg("-o")
            .arg(format!("-p {}", self.config.port));

        match run(&mut cmd).await {
            Ok(_) => Ok(()),
            Err(Error::CommandFailed {
                command,
                status,
                detail,
            }) => {
                // -w may time out with the postmaster still coming up
                self.stop_immediate();
                let log_tail = read_log_tail(&self.log_file).await;
                Err(Error::CommandFailed {
                    command,
                    status,
                    detail: if log_tail.is_empty() {
                        detail
                    } else {
                        format!("{detail}\n--- server log ---\n{log_tail}")
                    },
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Coordinates of this server.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// The cluster directory passed to `initdb` and `pg_ctl`.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn admin_url(&self) -> String {
        self.config.admin_url()
    }

    /// Opens a new administrative connection.
    pub async fn admin(&self) -> Result<AdminConn> {
        AdminConn::connect(&self.config).await
    }

    /// Stops the server gracefully and removes its directory.
    ///
    /// A failing `pg_ctl stop` is returned as an error; the drop safety net
    /// still attempts an immediate shutdown afterwards.
    #[instrument(name = "pgtestdb.server.stop", skip_all, fields(port = self.config.port), err)]
    pub async fn stop(mut self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut cmd = Command::new(&self.pg_ctl);
        cmd.arg("stop")
            .arg("-w")
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-m")
            .arg("fast");
        run(&mut cmd).await?;
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(port = self.config.port, "server stopped");

        self.release_dir()
    }

    /// Synchronous shutdown for contexts that cannot await, such as process
    /// exit hooks. Idempotent.
    pub fn shutdown_blocking(&self) {
        self.stop_immediate();
        if !self.config.keep_data && self.root_path.exists() {
            if let Err(err) = std::fs::remove_dir_all(&self.root_path) {
                tracing::warn!(
                    path = %self.root_path.display(),
                    error = %err,
                    "failed to remove server directory"
                );
            }
        }
    }

    /// Immediate-mode stop used by the safety nets. Errors are logged only.
    fn stop_immediate(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let status = std::process::Command::new(&self.pg_ctl)
            .arg("stop")
            .arg("-w")
            .arg("-D")
            .arg(&self.data_dir)
            .arg("-m")
            .arg("immediate")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(status) if status.success() => {
                tracing::debug!(port = self.config.port, "server stopped (immediate)");
            }
            Ok(status) => {
                tracing::warn!(port = self.config.port, %status, "pg_ctl stop -m immediate failed");
            }
            Err(err) => {
                tracing::warn!(port = self.config.port, error = %err, "could not run pg_ctl stop");
            }
        }
    }

    fn release_dir(&mut self) -> Result<()> {
        let Some(root) = self.root.take() else {
            return Ok(());
        };
        if self.config.keep_data {
            let kept = root.keep();
            tracing::info!(path = %kept.display(), "keeping server directory");
            return Ok(());
        }
        root.close().map_err(|source| Error::Io {
            path: self.root_path.clone(),
            source,
        })
    }
}

impl Drop for EphemeralServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            tracing::warn!(
                port = self.config.port,
                "server dropped while running, stopping immediately"
            );
            self.stop_immediate();
        }
        if let Err(err) = self.release_dir() {
            tracing::warn!(error = %err, "failed to remove server directory");
        }
    }
}

/// Runs `f` against a freshly started server, stopping it afterwards.
///
/// The server is stopped on every exit path. If `f` fails, its error is
/// returned even when stopping fails too; otherwise a failed stop is the
/// result.
pub async fn with_server<F, Fut, T>(config: ServerConfig, f: F) -> anyhow::Result<T>
where
    F: FnOnce(ServerConfig) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let server = EphemeralServer::start(config).await?;
    let result = scope::run_body(f(server.config().clone())).await;
    let stopped = server.stop().await;
    scope::finish(result, stopped, "server")
}

async fn run_initdb(
    initdb: &Path,
    config: &ServerConfig,
    root: &Path,
    data_dir: &Path,
) -> Result<()> {
    let mut cmd = Command::new(initdb);
    cmd.arg("-D")
        .arg(data_dir)
        .arg("--locale=C")
        .arg("--encoding=UTF8")
        .arg("--auth=trust")
        .arg("-U")
        .arg(&config.user);

    if let Some(password) = &config.password {
        let pwfile = root.join("pwfile");
        tokio::fs::write(&pwfile, password)
            .await
            .map_err(|source| Error::Io {
                path: pwfile.clone(),
                source,
            })?;
        cmd.arg(format!("--pwfile={}", pwfile.display()));
    }
    if config.tuned {
        cmd.arg("--no-sync");
    }

    run(&mut cmd).await.map(|_| ())
}

/// Renders the lines appended to `postgresql.conf` before first start.
pub fn server_conf_lines(config: &ServerConfig, socket_dir: &Path) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        "# pgtestdb".to_string(),
        format!("listen_addresses = '{}'", config.host),
        format!("unix_socket_directories = '{}'", socket_dir.display()),
    ];
    if config.tuned {
        lines.extend(TUNING_OVERLAY.iter().map(|(key, value)| format!("{key} = {value}")));
    }
    lines.extend(
        config
            .server_params
            .iter()
            .map(|(key, value)| format!("{key} = {value}")),
    );
    lines
}

async fn write_server_conf(config: &ServerConfig, root: &Path, data_dir: &Path) -> Result<()> {
    use tokio::io::AsyncWriteExt as _;

    let path = data_dir.join("postgresql.conf");
    let io_err = |source: std::io::Error| Error::Io {
        path: path.clone(),
        source,
    };

    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .await
        .map_err(io_err)?;
    let mut body = server_conf_lines(config, root).join("\n");
    body.push('\n');
    file.write_all(body.as_bytes()).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)
}

/// Runs a control command to completion, failing on a non-zero exit.
async fn run(cmd: &mut Command) -> Result<Output> {
    let command = render(cmd);
    tracing::debug!(%command, "running");

    let output = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| Error::Spawn {
            command: command.clone(),
            source,
        })?;

    if !output.status.success() {
        return Err(Error::CommandFailed {
            command,
            status: output.status.code(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

fn render(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    std::iter::once(std_cmd.get_program())
        .chain(std_cmd.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn read_log_tail(path: &Path) -> String {
    let Ok(content) = tokio::fs::read_to_string(path).await else {
        return String::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
}

/// Locates a server control binary.
///
/// Looks in `bin_dir` when given (and only there), otherwise on `PATH`,
/// otherwise in common distribution layouts, newest version first.
pub fn find_binary(name: &str, bin_dir: Option<&Path>) -> Result<PathBuf> {
    let not_found = || Error::BinaryNotFound {
        name: name.to_string(),
    };

    if let Some(dir) = bin_dir {
        let path = dir.join(name);
        return if path.is_file() { Ok(path) } else { Err(not_found()) };
    }

    if let Ok(path) = which::which(name) {
        return Ok(path);
    }

    let mut candidates: Vec<PathBuf> = SEARCH_PATTERNS
        .iter()
        .filter_map(|pattern| glob::glob(pattern).ok())
        .flatten()
        .filter_map(|entry| entry.ok())
        .map(|dir| dir.join(name))
        .filter(|path| path.is_file())
        .collect();
    candidates.sort_by_key(|path| std::cmp::Reverse(version_key(path)));
    candidates.into_iter().next().ok_or_else(not_found)
}

/// Numeric components of a path, so `.../16/bin` sorts above `.../9.6/bin`.
fn version_key(path: &Path) -> Vec<u32> {
    path.to_string_lossy()
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|part| part.parse().ok())
        .collect()
}
