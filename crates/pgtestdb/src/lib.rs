//! Build-once, clone-many PostgreSQL databases for tests.
//!
//! The crate starts a throwaway server ([`EphemeralServer`]), builds named
//! template databases by running a migration exactly once
//! ([`ensure_templates`]), and hands each test its own copy of a template
//! ([`with_clone`]). Copies are made by the server with
//! `CREATE DATABASE ... TEMPLATE ...`, which is much faster than replaying
//! migrations per test.
//!
//! Server coordinates always travel explicitly in a [`ServerConfig`], so
//! several servers can run side by side on different ports.
//!
//! ```no_run
//! use pgtestdb::{ServerConfig, TemplateSpec};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = ServerConfig::with_free_port()?;
//! pgtestdb::with_server(config, |config| async move {
//!     let spec = TemplateSpec::from_sql("app", "CREATE TABLE foo (a INT)");
//!     pgtestdb::ensure_templates_with_config(&config, &[spec.clone()]).await?;
//!     pgtestdb::with_clone(&config, &spec, |mut conn, _url| async move {
//!         conn.execute("INSERT INTO foo VALUES (1)").await?;
//!         Ok(())
//!     })
//!     .await
//! })
//! .await
//! # }
//! ```

pub mod clone;
pub mod config;
pub mod conn;
pub mod error;
pub mod ident;
mod scope;
pub mod server;
pub mod sql;
pub mod template;

pub use clone::{with_clone, with_clone_url, DatabaseClone};
pub use config::{pick_free_port, ServerConfig};
pub use conn::{AdminConn, DatabaseState, DbConn};
pub use error::{Error, Result};
pub use server::{find_binary, with_server, EphemeralServer};
pub use sql::CopyStrategy;
pub use template::{
    ensure as ensure_templates, ensure_with_config as ensure_templates_with_config,
    teardown as teardown_template, with_ephemeral_template, TemplateSpec,
};
