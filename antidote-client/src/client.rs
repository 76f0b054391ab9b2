//! High-level client API.

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::transaction::{check_values, unexpected, Transaction};
use antidote_protocol::{BoundObject, CommitTime, Request, Response, Update, Value};
use std::sync::Arc;

/// High-level client for one Antidote server.
///
/// The client owns a single connection. Transactions committed through it
/// form a causal session: each new transaction starts from a snapshot that
/// includes the previous commit.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Connects using the given configuration.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let conn = Connection::connect(config).await?;
        Ok(Self::from_connection(conn))
    }

    /// Connects to `host:port` with default timeouts.
    pub async fn connect_to(host: impl Into<String>, port: u16) -> Result<Self, ClientError> {
        Self::connect(ConnectionConfig::new(host, port)).await
    }

    /// Wraps an established connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(conn),
        }
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection. Idempotent.
    pub fn close(&self) {
        self.conn.close()
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Commit time of the latest transaction committed by this client.
    pub fn last_commit_time(&self) -> Option<CommitTime> {
        self.conn.last_commit_time()
    }

    // =========================================================================
    // Interactive transactions
    // =========================================================================

    /// Starts an interactive transaction.
    pub async fn start_transaction(&self) -> Result<Transaction, ClientError> {
        Transaction::begin(self.conn.clone()).await
    }

    // =========================================================================
    // Static transactions
    // =========================================================================

    /// Reads `objects` in a single-message transaction.
    pub async fn read_static(
        &self,
        objects: &[BoundObject],
    ) -> Result<(Vec<Value>, CommitTime), ClientError> {
        let request = Request::StaticReadObjects {
            timestamp: self.conn.last_commit_time(),
            objects: objects.to_vec(),
        };
        match self.conn.request(&request).await? {
            Response::StaticReadObjects { objects: read, commit } => {
                let values = read.map_err(|code| ClientError::Server {
                    code,
                    message: "static read failed".to_string(),
                })?;
                let time = commit.map_err(|code| ClientError::Server {
                    code,
                    message: "static read commit failed".to_string(),
                })?;
                let values = check_values(objects, values)?;
                self.conn.record_commit(&time);
                Ok((values, time))
            }
            other => Err(unexpected(&request, &other)),
        }
    }

    /// Applies `updates` in a single-message transaction.
    pub async fn update_static(&self, updates: Vec<Update>) -> Result<CommitTime, ClientError> {
        let request = Request::StaticUpdateObjects {
            timestamp: self.conn.last_commit_time(),
            updates,
        };
        match self.conn.request(&request).await? {
            Response::Commit(Ok(time)) => {
                self.conn.record_commit(&time);
                Ok(time)
            }
            Response::Commit(Err(code)) => Err(ClientError::Server {
                code,
                message: "static update failed".to_string(),
            }),
            other => Err(unexpected(&request, &other)),
        }
    }
}
