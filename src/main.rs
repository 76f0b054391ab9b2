//! antidote - counter smoke test
//!
//! Connects to an Antidote server, increments a counter inside a
//! transaction, reads it back and commits.

use antidote_client::{BoundObject, Client, Config, CrdtType, Operation};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if ANTIDOTE_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    let conn_config = config.connection_config();

    tracing::info!("Connecting to {}", conn_config.addr());
    let client = Client::connect(conn_config).await?;

    let result = run_counter(&client).await;
    client.close();

    match result {
        Ok(value) => {
            tracing::info!("counter value = {}", value);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Error: {}", e);
            Err(e.into())
        }
    }
}

async fn run_counter(client: &Client) -> Result<i64, antidote_client::ClientError> {
    let key = BoundObject::new("testKey", CrdtType::Counter, "myBucket")?;

    let mut tx = client.start_transaction().await?;
    tx.update(key.clone(), Operation::increment(1)).await?;
    let value = tx.read(&key).await?;
    let commit_time = tx.commit().await?;
    tracing::debug!(?commit_time, "Committed");

    // The read is checked against the object type, so this is a counter.
    Ok(value.as_counter().unwrap_or_default())
}
