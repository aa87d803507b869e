//! Test helpers for pgtestdb.
//!
//! One ephemeral PostgreSQL server is started per test process on first use
//! and shared by every test in it. Each template is ensured once per process,
//! and each test body gets its own clone, dropped when the test ends.
//!
//! # Quick Start
//!
//! ```ignore
//! use pgtestdb::TemplateSpec;
//! use std::sync::LazyLock;
//!
//! static ACCOUNTS: LazyLock<TemplateSpec> =
//!     LazyLock::new(|| TemplateSpec::from_sql("accounts", "CREATE TABLE account (id INT)"));
//!
//! #[pgtestdb_test::test(template = ACCOUNTS)]
//! async fn inserts_account(conn: _) -> anyhow::Result<()> {
//!     conn.execute("INSERT INTO account VALUES (1)").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Environment
//!
//! The server is configured by [`ServerConfig::from_env`]; without
//! `PGTESTDB_PORT` a free port is picked. Tests are skipped when no
//! PostgreSQL binaries are found, or when running as root (`initdb` refuses
//! to run as root).

use std::collections::HashSet;
use std::sync::{LazyLock, Once};

use pgtestdb::{DbConn, EphemeralServer, ServerConfig, TemplateSpec};
use tokio::sync::{Mutex, OnceCell};

/// Re-export the test macro.
///
/// Use as `#[pgtestdb_test::test(template = EXPR)]`
pub use pgtestdb_test_macros::test;

static SERVER: OnceCell<EphemeralServer> = OnceCell::const_new();

static ENSURED: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

static EXIT_HOOK: Once = Once::new();

/// Statics are never dropped, so the shared server is stopped at process exit.
fn register_exit_handler() {
    extern "C" fn cleanup() {
        if let Some(server) = SERVER.get() {
            eprintln!("[pgtestdb-test] atexit: stopping server on port {}", server.port());
            server.shutdown_blocking();
        }
    }

    EXIT_HOOK.call_once(|| unsafe {
        libc::atexit(cleanup);
    });
}

/// Configuration for the shared server, before a port is chosen.
pub fn test_config() -> pgtestdb::Result<ServerConfig> {
    let mut config = ServerConfig::from_env()?;
    if std::env::var_os("PGTESTDB_PORT").is_none() {
        config.port = pgtestdb::pick_free_port()?;
    }
    Ok(config)
}

/// The server shared by all tests in this process, started on first call.
pub async fn test_server() -> anyhow::Result<&'static EphemeralServer> {
    let server = SERVER
        .get_or_try_init(|| async {
            init_tracing();
            let config = test_config()?;
            eprintln!("[pgtestdb-test] starting server on port {}", config.port);
            let server = EphemeralServer::start(config).await?;
            register_exit_handler();
            Ok::<_, anyhow::Error>(server)
        })
        .await?;
    Ok(server)
}

/// Ensures `spec` on the shared server, at most once per process.
pub async fn ensure_template(spec: &TemplateSpec) -> anyhow::Result<&'static ServerConfig> {
    let server = test_server().await?;
    let mut ensured = ENSURED.lock().await;
    if !ensured.contains(spec.name()) {
        pgtestdb::ensure_templates_with_config(server.config(), std::slice::from_ref(spec))
            .await?;
        ensured.insert(spec.name().to_string());
    }
    Ok(server.config())
}

/// Runs a test body against a fresh clone of `spec`.
///
/// The template is ensured first. The clone is dropped afterwards, even
/// when the body fails.
pub async fn with_test_db<F, Fut, T>(spec: &TemplateSpec, f: F) -> anyhow::Result<T>
where
    F: FnOnce(DbConn, String) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let config = ensure_template(spec).await?;
    pgtestdb::with_clone(config, spec, f).await
}

/// Whether this process can start a server at all.
pub fn postgres_available() -> bool {
    if unsafe { libc::geteuid() } == 0 {
        return false;
    }
    let bin_dir = ServerConfig::from_env().ok().and_then(|config| config.bin_dir);
    ["initdb", "pg_ctl"]
        .iter()
        .all(|name| pgtestdb::find_binary(name, bin_dir.as_deref()).is_ok())
}

/// Installs a `tracing` subscriber honoring `RUST_LOG`; repeated calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
