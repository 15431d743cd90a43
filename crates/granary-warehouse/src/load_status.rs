//! Transaction-log probe for the outcome of a previously submitted COPY.
//!
//! Order matters: the recent-queries view only shows live work, the
//! historical views only fill in after the fact. Anything that is found,
//! has a transaction, and is neither committed nor undone is assumed to
//! still be running.

use sqlx::PgConnection;

use granary_core::{Error, LoadStatus, Result};

use crate::copy::copy_search_pattern;

pub(crate) async fn check_load_status(
    conn: &mut PgConnection,
    manifest_url: &str,
) -> Result<LoadStatus> {
    let pattern = copy_search_pattern(manifest_url);

    let running: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM stv_recents WHERE query ILIKE $1 AND status != 'Done'",
    )
    .bind(&pattern)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| Error::warehouse("querying stv_recents", &e))?;
    if running != 0 {
        tracing::info!(manifest_url, "manifest copy is in stv_recents as running");
        return Ok(LoadStatus::InProgress);
    }

    let row: Option<(i64, i32)> =
        sqlx::query_as("SELECT xid, aborted FROM stl_query WHERE querytxt ILIKE $1")
            .bind(&pattern)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| Error::warehouse("querying stl_query", &e))?;
    let Some((xid, aborted)) = row else {
        tracing::info!(manifest_url, "manifest copy has no transaction id");
        return Ok(LoadStatus::NotFound);
    };
    if aborted == 1 {
        tracing::info!(manifest_url, "manifest copy was aborted while running");
        return Ok(LoadStatus::Failed);
    }

    let committed: i64 =
        sqlx::query_scalar("SELECT count(*) FROM stl_utilitytext WHERE xid = $1 AND text = 'COMMIT'")
            .bind(xid)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| Error::warehouse("querying stl_utilitytext", &e))?;
    if committed != 0 {
        tracing::info!(manifest_url, "manifest copy was committed");
        return Ok(LoadStatus::Complete);
    }

    let undone: i64 = sqlx::query_scalar("SELECT count(*) FROM stl_undone WHERE xact_id_undone = $1")
        .bind(xid)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| Error::warehouse("querying stl_undone", &e))?;
    if undone != 0 {
        tracing::info!(manifest_url, "manifest copy was rolled back");
        return Ok(LoadStatus::Failed);
    }

    tracing::info!(
        manifest_url,
        "manifest copy has a transaction, neither committed nor undone; assuming it is running"
    );
    Ok(LoadStatus::InProgress)
}
