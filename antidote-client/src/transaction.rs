//! Interactive transactions.

use crate::connection::Connection;
use crate::error::ClientError;
use antidote_protocol::{
    BoundObject, CommitTime, Operation, ProtocolError, Request, Response, TransactionDescriptor,
    Update, Value,
};
use std::fmt;
use std::sync::Arc;

/// Lifecycle of a transaction.
///
/// A transaction is handed out only once the server has issued its
/// descriptor, so it starts out `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborted,
    /// The connection failed mid-transaction; the transaction cannot be
    /// resumed.
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionState::Active => "active",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
            TransactionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A server-side transaction bound to one connection.
///
/// Reads and updates are only valid while the transaction is active; any
/// other state fails locally without touching the network.
pub struct Transaction {
    conn: Arc<Connection>,
    descriptor: TransactionDescriptor,
    state: TransactionState,
}

impl Transaction {
    /// Starts a transaction, passing the connection's latest commit time so
    /// the snapshot includes earlier commits.
    pub(crate) async fn begin(conn: Arc<Connection>) -> Result<Self, ClientError> {
        let request = Request::StartTransaction {
            timestamp: conn.last_commit_time(),
        };
        let descriptor = match conn.request(&request).await? {
            Response::StartTransaction(Ok(descriptor)) => descriptor,
            Response::StartTransaction(Err(code)) => {
                return Err(ClientError::Server {
                    code,
                    message: "start transaction failed".to_string(),
                })
            }
            other => return Err(unexpected(&request, &other)),
        };

        tracing::debug!(conn = %conn.id(), ?descriptor, "Transaction started");
        Ok(Self {
            conn,
            descriptor,
            state: TransactionState::Active,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn descriptor(&self) -> &TransactionDescriptor {
        &self.descriptor
    }

    /// Applies `operation` to `object`.
    ///
    /// A mismatched operation fails with [`ClientError::InvalidOperation`]
    /// before anything is sent.
    pub async fn update(
        &mut self,
        object: BoundObject,
        operation: impl Into<Operation>,
    ) -> Result<(), ClientError> {
        self.ensure_active("update")?;
        let update = Update::new(object, operation)?;
        self.update_objects(vec![update]).await
    }

    /// Applies several updates in one round trip.
    pub async fn update_objects(&mut self, updates: Vec<Update>) -> Result<(), ClientError> {
        self.ensure_active("update")?;
        if updates.is_empty() {
            return Ok(());
        }

        let request = Request::UpdateObjects {
            updates,
            descriptor: self.descriptor.clone(),
        };
        match self.exchange(&request).await? {
            Response::Operation(Ok(())) => Ok(()),
            Response::Operation(Err(code)) => Err(ClientError::Server {
                code,
                message: "update objects failed".to_string(),
            }),
            other => Err(self.fail(unexpected(&request, &other))),
        }
    }

    /// Reads the value of one object as seen by this transaction.
    pub async fn read(&mut self, object: &BoundObject) -> Result<Value, ClientError> {
        let mut values = self.read_values(std::slice::from_ref(object)).await?;
        values
            .pop()
            .ok_or_else(|| ProtocolError::ValueCountMismatch {
                requested: 1,
                returned: 0,
            }
            .into())
    }

    /// Reads several objects in one round trip. Values are returned in the
    /// order the objects were given.
    pub async fn read_values(
        &mut self,
        objects: &[BoundObject],
    ) -> Result<Vec<Value>, ClientError> {
        self.ensure_active("read")?;
        if objects.is_empty() {
            return Ok(Vec::new());
        }

        let request = Request::ReadObjects {
            objects: objects.to_vec(),
            descriptor: self.descriptor.clone(),
        };
        match self.exchange(&request).await? {
            Response::ReadObjects(Ok(values)) => {
                check_values(objects, values).map_err(|e| self.fail(e))
            }
            Response::ReadObjects(Err(code)) => Err(ClientError::Server {
                code,
                message: "read objects failed".to_string(),
            }),
            other => Err(self.fail(unexpected(&request, &other))),
        }
    }

    /// Commits the transaction and returns its commit time.
    ///
    /// Any failure leaves the transaction `Failed`; it must not be retried.
    pub async fn commit(&mut self) -> Result<CommitTime, ClientError> {
        self.ensure_active("commit")?;
        self.state = TransactionState::Committing;

        let request = Request::CommitTransaction {
            descriptor: self.descriptor.clone(),
        };
        let result = match self.conn.request(&request).await {
            Ok(Response::Commit(Ok(time))) => Ok(time),
            Ok(Response::Commit(Err(code))) => Err(ClientError::Server {
                code,
                message: "commit failed".to_string(),
            }),
            Ok(other) => Err(unexpected(&request, &other)),
            Err(e) => Err(e),
        };

        match result {
            Ok(time) => {
                self.state = TransactionState::Committed;
                self.conn.record_commit(&time);
                tracing::debug!(
                    conn = %self.conn.id(),
                    descriptor = ?self.descriptor,
                    commit_time = ?time,
                    "Transaction committed"
                );
                Ok(time)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Aborts the transaction.
    ///
    /// The server is told on a best-effort basis: the transaction ends up
    /// `Aborted` even if the notification fails. Aborting a failed or
    /// already aborted transaction does nothing.
    pub async fn abort(&mut self) -> Result<(), ClientError> {
        match self.state {
            TransactionState::Active => {}
            TransactionState::Aborted | TransactionState::Failed => {
                self.state = TransactionState::Aborted;
                return Ok(());
            }
            state => {
                return Err(ClientError::TransactionState {
                    state,
                    operation: "abort",
                })
            }
        }

        self.state = TransactionState::Aborted;
        let request = Request::AbortTransaction {
            descriptor: self.descriptor.clone(),
        };
        match self.conn.request(&request).await {
            Ok(Response::Operation(Ok(()))) => {
                tracing::debug!(conn = %self.conn.id(), descriptor = ?self.descriptor, "Transaction aborted");
            }
            Ok(other) => {
                tracing::debug!(conn = %self.conn.id(), "Abort not acknowledged: {:?}", other);
            }
            Err(e) => {
                tracing::debug!(conn = %self.conn.id(), "Abort notification failed: {}", e);
            }
        }
        Ok(())
    }

    fn ensure_active(&self, operation: &'static str) -> Result<(), ClientError> {
        if self.state == TransactionState::Active {
            Ok(())
        } else {
            Err(ClientError::TransactionState {
                state: self.state,
                operation,
            })
        }
    }

    /// Sends `request`; a network or decode failure fails the transaction.
    async fn exchange(&mut self, request: &Request) -> Result<Response, ClientError> {
        match self.conn.request(request).await {
            Err(e) if e.is_network_failure() || matches!(e, ClientError::Protocol(_)) => {
                Err(self.fail(e))
            }
            other => other,
        }
    }

    fn fail(&mut self, err: ClientError) -> ClientError {
        if self.state != TransactionState::Failed {
            tracing::debug!(
                conn = %self.conn.id(),
                descriptor = ?self.descriptor,
                "Transaction failed: {}",
                err
            );
        }
        self.state = TransactionState::Failed;
        err
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            tracing::warn!(
                conn = %self.conn.id(),
                descriptor = ?self.descriptor,
                "Transaction dropped while active; it was neither committed nor aborted"
            );
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("conn", &self.conn.id())
            .field("descriptor", &self.descriptor)
            .field("state", &self.state)
            .finish()
    }
}

/// Checks that a read returned one value of the right shape per object.
pub(crate) fn check_values(
    objects: &[BoundObject],
    values: Vec<Value>,
) -> Result<Vec<Value>, ClientError> {
    if values.len() != objects.len() {
        return Err(ProtocolError::ValueCountMismatch {
            requested: objects.len(),
            returned: values.len(),
        }
        .into());
    }
    for (object, value) in objects.iter().zip(&values) {
        if !value.matches(object.crdt_type()) {
            return Err(ProtocolError::ValueTypeMismatch {
                object: object.to_string(),
                expected: object.crdt_type(),
            }
            .into());
        }
    }
    Ok(values)
}

pub(crate) fn unexpected(request: &Request, response: &Response) -> ClientError {
    ProtocolError::UnexpectedMessage {
        expected: request.response_code(),
        actual: response.code(),
    }
    .into()
}
