//! Catalog statements issued by the registry and the clone manager.
//!
//! Values are bound as parameters. Names are validated by the caller and
//! rendered with [`quote`]; nothing else in the crate formats SQL.

use std::fmt;

use crate::ident::{quote, quote_literal};

pub const ROLE_EXISTS: &str = "SELECT EXISTS (SELECT FROM pg_catalog.pg_roles WHERE rolname = $1)";

pub const DATABASE_EXISTS: &str =
    "SELECT EXISTS (SELECT FROM pg_catalog.pg_database WHERE datname = $1)";

/// Yields no row when the database is absent, else its template flag and owner.
pub const DATABASE_STATE: &str =
    "SELECT datistemplate, pg_catalog.pg_get_userbyid(datdba)::text \
     FROM pg_catalog.pg_database WHERE datname = $1";

/// Session-level lock serializing builders of the same template name.
pub const LOCK_TEMPLATE: &str = "SELECT pg_advisory_lock(hashtext('pgtestdb:' || $1))";

pub const UNLOCK_TEMPLATE: &str = "SELECT pg_advisory_unlock(hashtext('pgtestdb:' || $1))";

/// SQLSTATE for `duplicate_object` (e.g. role already exists).
pub const DUPLICATE_OBJECT: &str = "42710";

/// SQLSTATE for `object_in_use` (database still has sessions).
pub const OBJECT_IN_USE: &str = "55006";

pub fn create_role(role: &str) -> String {
    format!("CREATE ROLE {}", quote(role))
}

/// Login with a password, no elevated privileges.
pub fn alter_role(role: &str, password: &str) -> String {
    format!(
        "ALTER ROLE {} WITH LOGIN PASSWORD {} NOSUPERUSER NOCREATEDB NOCREATEROLE",
        quote(role),
        quote_literal(password)
    )
}

/// [`alter_role`] as shown in logs and errors.
pub fn alter_role_masked(role: &str) -> String {
    alter_role(role, "***")
}

pub fn drop_role(role: &str) -> String {
    format!("DROP ROLE IF EXISTS {}", quote(role))
}

pub fn create_database(name: &str, owner: &str) -> String {
    format!("CREATE DATABASE {} OWNER {}", quote(name), quote(owner))
}

pub fn set_template(name: &str, is_template: bool) -> String {
    format!("ALTER DATABASE {} WITH IS_TEMPLATE {is_template}", quote(name))
}

pub fn drop_database(name: &str) -> String {
    format!("DROP DATABASE IF EXISTS {}", quote(name))
}

/// How the server copies the template's files into a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    /// Copy files directly. Fastest for small templates.
    FileCopy,
    /// Copy block by block through the write-ahead log.
    WalLog,
}

impl fmt::Display for CopyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileCopy => f.write_str("FILE_COPY"),
            Self::WalLog => f.write_str("WAL_LOG"),
        }
    }
}

/// `CREATE DATABASE ... TEMPLATE ...`; `STRATEGY` needs PostgreSQL 15+.
pub fn clone_database(
    name: &str,
    template: &str,
    owner: &str,
    strategy: Option<CopyStrategy>,
) -> String {
    let mut sql = format!(
        "CREATE DATABASE {} WITH TEMPLATE {} OWNER {}",
        quote(name),
        quote(template),
        quote(owner)
    );
    if let Some(strategy) = strategy {
        sql.push_str(&format!(" STRATEGY {strategy}"));
    }
    sql
}
