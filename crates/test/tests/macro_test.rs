//! Tests for the #[pgtestdb_test::test] macro.

use std::sync::LazyLock;

use pgtestdb::TemplateSpec;
use pgtestdb_test::test;
use pretty_assertions::assert_eq;

static WIDGETS: LazyLock<TemplateSpec> = LazyLock::new(|| {
    TemplateSpec::from_sql(
        "macro_widgets",
        "CREATE TABLE widget (id INT PRIMARY KEY, label TEXT NOT NULL);
         INSERT INTO widget VALUES (1, 'seed');",
    )
});

/// Test with both conn and url parameters.
#[test(template = WIDGETS)]
async fn test_with_both_params(conn: _, url: _) -> anyhow::Result<()> {
    assert!(url.contains("/macro_widgets_"));

    conn.execute("INSERT INTO widget VALUES (2, 'added')").await?;
    let count: i64 = sqlx::query_scalar("SELECT count(*) FROM widget")
        .fetch_one(&mut *conn)
        .await?;
    assert_eq!(count, 2);
    Ok(())
}

/// Test with only the conn parameter; seed rows come from the template.
#[test(template = WIDGETS)]
async fn test_with_conn_only(conn: _) -> anyhow::Result<()> {
    let labels: Vec<String> = sqlx::query_scalar("SELECT label FROM widget ORDER BY id")
        .fetch_all(&mut *conn)
        .await?;
    assert_eq!(labels, vec!["seed".to_string()]);
    Ok(())
}

/// Test with no parameters (rare but valid).
#[test(template = WIDGETS)]
async fn test_with_no_params() -> anyhow::Result<()> {
    Ok(())
}
