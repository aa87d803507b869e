//! Clone manager
//!
//! Copies a finalized template into a fresh database named after it plus a
//! random suffix. Clones are owned by the template's role and dropped again
//! when the scope using them ends.

use std::future::Future;

use tracing::instrument;

use crate::conn::{AdminConn, DbConn};
use crate::sql::{self, CopyStrategy};
use crate::{ident, scope, Result, ServerConfig, TemplateSpec};

/// A database copied from a template.
///
/// Nothing drops the database implicitly; pass the value to
/// [`DatabaseClone::destroy`] or use [`with_clone`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseClone {
    name: String,
    template: String,
    owner: String,
    url: String,
}

impl DatabaseClone {
    /// Creates a clone of `spec`'s template, which must already be ensured.
    #[instrument(
        name = "pgtestdb.clone.create",
        skip_all,
        fields(template = spec.name(), clone = tracing::field::Empty),
        err
    )]
    pub async fn create(
        admin: &mut AdminConn,
        spec: &TemplateSpec,
        strategy: Option<CopyStrategy>,
    ) -> Result<Self> {
        spec.validate()?;
        let name = ident::clone_name(spec.name());
        tracing::Span::current().record("clone", name.as_str());

        admin
            .execute(&sql::clone_database(&name, spec.name(), spec.role(), strategy))
            .await?;

        Ok(Self {
            url: spec.url(admin.config(), &name),
            name,
            template: spec.name().to_string(),
            owner: spec.role().to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Template this clone was copied from.
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Connection URL, as the owning role.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connect(&self) -> Result<DbConn> {
        DbConn::connect(&self.url).await
    }

    /// Drops the clone. Retried while lingering sessions keep it in use.
    #[instrument(name = "pgtestdb.clone.destroy", skip_all, fields(clone = %self.name), err)]
    pub async fn destroy(self, admin: &mut AdminConn) -> Result<()> {
        admin.drop_database(&self.name).await
    }
}

/// Runs `f` with a connection to a fresh clone of `spec`, and its URL.
///
/// The clone is dropped on every exit path, panics included. The template
/// must have been ensured beforehand.
pub async fn with_clone<F, Fut, T>(config: &ServerConfig, spec: &TemplateSpec, f: F) -> anyhow::Result<T>
where
    F: FnOnce(DbConn, String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut admin = AdminConn::connect(config).await?;
    let clone = match DatabaseClone::create(&mut admin, spec, None).await {
        Ok(clone) => clone,
        Err(err) => {
            if let Err(close_err) = admin.close().await {
                tracing::warn!(error = %close_err, "failed to close admin connection");
            }
            return Err(err.into());
        }
    };

    let url = clone.url().to_string();
    let result = scope::run_body(async {
        let conn = clone.connect().await?;
        f(conn, url).await
    })
    .await;

    finish(admin, clone, result).await
}

/// Like [`with_clone`], handing `f` only the clone URL.
pub async fn with_clone_url<F, Fut, T>(
    config: &ServerConfig,
    spec: &TemplateSpec,
    f: F,
) -> anyhow::Result<T>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    with_clone(config, spec, |conn, url| async move {
        conn.close().await?;
        f(url).await
    })
    .await
}

async fn finish<T>(
    mut admin: AdminConn,
    clone: DatabaseClone,
    result: std::result::Result<anyhow::Result<T>, scope::Panic>,
) -> anyhow::Result<T> {
    let what = format!("clone '{}'", clone.name());
    let destroyed = clone.destroy(&mut admin).await;
    let closed = admin.close().await;
    scope::finish(result, scope::merge_cleanup(destroyed, closed, "admin connection"), &what)
}
