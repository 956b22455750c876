//! Source database connections.

use anyhow::Result;
use tokio_postgres::NoTls;
use tracing::error;

/// Connect to the source database and spawn the connection driver task.
///
/// Transport security is assumed to be provided by the deployment (socket or
/// sidecar), matching the replication connection contract.
pub async fn connect_source(dsn: &str) -> Result<tokio_postgres::Client> {
    let (client, connection) = tokio_postgres::connect(dsn, NoTls)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to PostgreSQL: {e}"))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {e}");
        }
    });

    Ok(client)
}
