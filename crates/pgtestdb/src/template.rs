//! Template registry
//!
//! A template is a database built once by running a migration, then flagged
//! with `IS_TEMPLATE` so clones can be copied from it. [`ensure`] is
//! idempotent: a template that is already flagged is left alone and its
//! migration is not run again.
//!
//! # Example
//!
//! ```no_run
//! use pgtestdb::{DbConn, ServerConfig, TemplateSpec};
//!
//! # async fn demo(config: ServerConfig) -> anyhow::Result<()> {
//! let spec = TemplateSpec::new("accounts", |url| async move {
//!     let mut conn = DbConn::connect(&url).await?;
//!     conn.execute("CREATE TABLE account (id BIGINT PRIMARY KEY)").await?;
//!     conn.close().await?;
//!     Ok(())
//! });
//! pgtestdb::ensure_templates_with_config(&config, &[spec]).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use tracing::instrument;

use crate::conn::{AdminConn, DatabaseState, DbConn};
use crate::{ident, scope, sql, Error, Result, ServerConfig};

type Migration = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A named template and the migration that builds it.
///
/// The name is the idempotency key: two specs with the same name are
/// expected to carry the same migration. The migration receives the URL of
/// the freshly created, not yet finalized database, connecting as the
/// template's role.
#[derive(Clone)]
pub struct TemplateSpec {
    name: String,
    role: String,
    password: String,
    migrate: Migration,
}

impl TemplateSpec {
    /// A template owned by a role of the same name, with the name as password.
    pub fn new<F, Fut>(name: impl Into<String>, migrate: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        Self {
            role: name.clone(),
            password: name.clone(),
            name,
            migrate: Arc::new(move |url| migrate(url).boxed()),
        }
    }

    /// A template whose migration is a single SQL script.
    pub fn from_sql(name: impl Into<String>, script: impl Into<String>) -> Self {
        let script: Arc<str> = Arc::from(script.into());
        Self::new(name, move |url| {
            let script = script.clone();
            async move {
                let mut conn = DbConn::connect(&url).await?;
                conn.execute(&script).await?;
                conn.close().await?;
                Ok(())
            }
        })
    }

    /// Uses `role` with `password` as the owner instead of the default.
    pub fn with_role(mut self, role: impl Into<String>, password: impl Into<String>) -> Self {
        self.role = role.into();
        self.password = password.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Rejects names that are unsafe to interpolate or too long to clone.
    pub fn validate(&self) -> Result<()> {
        ident::validate_template_name(&self.name)?;
        ident::validate(&self.role)
    }

    /// URL of `database` on the server described by `config`, as this
    /// template's role.
    pub fn url(&self, config: &ServerConfig, database: &str) -> String {
        config.url_for(&self.role, Some(&self.password), database)
    }

    async fn migrate(&self, url: String) -> anyhow::Result<()> {
        (self.migrate)(url).await
    }
}

impl fmt::Debug for TemplateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateSpec")
            .field("name", &self.name)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Makes sure every template in `specs` exists and is finalized, in order.
///
/// The first failure aborts the call. Work already done for earlier specs is
/// kept, and a template whose migration failed is rebuilt from scratch on
/// the next call.
#[instrument(name = "pgtestdb.template.ensure", skip_all, fields(count = specs.len()), err)]
pub async fn ensure(admin: &mut AdminConn, specs: &[TemplateSpec]) -> Result<()> {
    for spec in specs {
        spec.validate()?;
        admin.fetch_all(sql::LOCK_TEMPLATE, &[spec.name()]).await?;
        let built = build(admin, spec).await;
        let unlocked = admin
            .fetch_all(sql::UNLOCK_TEMPLATE, &[spec.name()])
            .await
            .map(|_| ());
        scope::merge_cleanup(built, unlocked, "template lock")?;
    }
    Ok(())
}

/// [`ensure`] over a dedicated administrative connection.
pub async fn ensure_with_config(config: &ServerConfig, specs: &[TemplateSpec]) -> Result<()> {
    let mut admin = AdminConn::connect(config).await?;
    let ensured = ensure(&mut admin, specs).await;
    scope::merge_cleanup(ensured, admin.close().await, "admin connection")
}

#[instrument(name = "pgtestdb.template.build", skip_all, fields(template = spec.name()), err)]
async fn build(admin: &mut AdminConn, spec: &TemplateSpec) -> Result<()> {
    let state = admin.database_state(spec.name()).await?;
    if let Some(state) = &state {
        check_owner(spec, state)?;
    }
    ensure_role(admin, spec).await?;

    match state {
        Some(state) if state.is_template => {
            tracing::debug!("template already finalized");
            return Ok(());
        }
        Some(_) => {
            tracing::warn!("dropping unfinalized leftover from an earlier failed build");
            admin.drop_database(spec.name()).await?;
        }
        None => {}
    }

    admin
        .execute(&sql::create_database(spec.name(), spec.role()))
        .await?;

    let url = spec.url(admin.config(), spec.name());
    spec.migrate(url)
        .await
        .map_err(|source| Error::Migration {
            template: spec.name().to_string(),
            source,
        })?;

    admin.execute(&sql::set_template(spec.name(), true)).await?;
    tracing::info!("template finalized");
    Ok(())
}

/// Only databases owned by the template's role were created by [`build`].
fn check_owner(spec: &TemplateSpec, state: &DatabaseState) -> Result<()> {
    if state.owner == spec.role() {
        return Ok(());
    }
    Err(Error::NameConflict {
        name: spec.name().to_string(),
        owner: state.owner.clone(),
        role: spec.role().to_string(),
    })
}

async fn ensure_role(admin: &mut AdminConn, spec: &TemplateSpec) -> Result<()> {
    if !admin.role_exists(spec.role()).await? {
        match admin.execute(&sql::create_role(spec.role())).await {
            Ok(_) => tracing::debug!(role = spec.role(), "role created"),
            Err(err) if err.sqlstate().as_deref() == Some(sql::DUPLICATE_OBJECT) => {
                tracing::debug!(role = spec.role(), "role created concurrently");
            }
            Err(err) => return Err(err),
        }
    }
    admin
        .execute_masked(
            &sql::alter_role(spec.role(), spec.password()),
            &sql::alter_role_masked(spec.role()),
        )
        .await?;
    Ok(())
}

/// Removes a template: clears its flag, drops the database, then the role.
///
/// Clones still owned by the role make the role drop fail.
#[instrument(name = "pgtestdb.template.teardown", skip_all, fields(template = spec.name()), err)]
pub async fn teardown(admin: &mut AdminConn, spec: &TemplateSpec) -> Result<()> {
    spec.validate()?;
    if let Some(state) = admin.database_state(spec.name()).await? {
        check_owner(spec, &state)?;
        admin.execute(&sql::set_template(spec.name(), false)).await?;
    }
    admin.drop_database(spec.name()).await?;
    admin.execute(&sql::drop_role(spec.role())).await?;
    Ok(())
}

/// Builds `spec`, runs `f`, then tears the template down again.
///
/// For templates that should only live as long as one scope. Teardown runs
/// even if `f` fails or panics.
pub async fn with_ephemeral_template<F, Fut, T>(
    config: &ServerConfig,
    spec: &TemplateSpec,
    f: F,
) -> anyhow::Result<T>
where
    F: FnOnce(ServerConfig) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    ensure_with_config(config, std::slice::from_ref(spec)).await?;
    let result = scope::run_body(f(config.clone())).await;
    let torn_down = teardown_with_config(config, spec).await;
    scope::finish(result, torn_down, &format!("template '{}'", spec.name()))
}

async fn teardown_with_config(config: &ServerConfig, spec: &TemplateSpec) -> Result<()> {
    let mut admin = AdminConn::connect(config).await?;
    let removed = teardown(&mut admin, spec).await;
    scope::merge_cleanup(removed, admin.close().await, "admin connection")
}
