//! # antidote-client
//!
//! Async client library for the Antidote CRDT database.
//!
//! This crate provides:
//! - A TCP transport session speaking the length-prefixed frame format
//! - A request dispatcher matching responses to requests in send order
//! - Interactive and single-message transactions
//! - File and environment configuration
//!
//! ```no_run
//! use antidote_client::{BoundObject, Client, CrdtType, Operation};
//!
//! # async fn run() -> Result<(), antidote_client::ClientError> {
//! let client = Client::connect_to("127.0.0.1", 8087).await?;
//! let counter = BoundObject::new("hits", CrdtType::Counter, "web")?;
//!
//! let mut tx = client.start_transaction().await?;
//! tx.update(counter.clone(), Operation::increment(1)).await?;
//! let value = tx.read(&counter).await?;
//! tx.commit().await?;
//!
//! println!("hits = {}", value);
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod transaction;
pub mod transport;

pub use client::Client;
pub use config::{Config, ConfigError, ConnectionConfig};
pub use connection::{Connection, ConnectionState};
pub use error::ClientError;
pub use transaction::{Transaction, TransactionState};

pub use antidote_protocol::{
    BoundObject, CommitTime, CrdtType, ErrorCode, MapKey, MapOp, Operation, TransactionDescriptor,
    Update, Value,
};
