//! Append-only sink for the three audit record kinds.
//!
//! [`AuditStore`] is the only persistence surface the recorders use. The
//! `SQLite` implementation additionally accepts entity records inside the
//! caller's business transaction, so they commit or roll back with the
//! changes they describe.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use tokio::time::timeout;

use crate::models::{EntityAuditRecord, HandlerAuditRecord, RequestAuditRecord};
use crate::persistence::db::Database;
use crate::persistence::entity_repo::{self, EntityRepo};
use crate::persistence::handler_repo::HandlerRepo;
use crate::persistence::request_repo::RequestRepo;
use crate::{AppError, Result};

/// Boxed future returned by [`AuditStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// All records sharing one correlation id.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AuditTrail {
    /// Request-level records (normally exactly one).
    pub requests: Vec<RequestAuditRecord>,
    /// Handler-level records in start order.
    pub handlers: Vec<HandlerAuditRecord>,
    /// Entity-level records in capture order.
    pub entities: Vec<EntityAuditRecord>,
}

impl AuditTrail {
    /// Entity records nested under handler `handler_id`.
    #[must_use]
    pub fn entities_for(&self, handler_id: &str) -> Vec<&EntityAuditRecord> {
        self.entities
            .iter()
            .filter(|e| e.handler_audit_log_id.as_deref() == Some(handler_id))
            .collect()
    }
}

/// Persistence sink shared by every concurrent request.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`]. Records are only appended
/// or completed; nothing here deletes audit data.
pub trait AuditStore: Send + Sync {
    /// Append a newly started request record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn add_request<'a>(&'a self, record: &'a RequestAuditRecord) -> StoreFuture<'a, ()>;

    /// Persist the completion fields of a request record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record was never stored.
    fn complete_request<'a>(&'a self, record: &'a RequestAuditRecord) -> StoreFuture<'a, ()>;

    /// Append a newly started handler record.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn add_handler<'a>(&'a self, record: &'a HandlerAuditRecord) -> StoreFuture<'a, ()>;

    /// Persist the completion fields of a handler record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record was never stored.
    fn complete_handler<'a>(&'a self, record: &'a HandlerAuditRecord) -> StoreFuture<'a, ()>;

    /// Flag a stored handler record as failed, appending `message`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the record was never stored.
    fn mark_handler_failed<'a>(&'a self, id: &'a str, message: &'a str) -> StoreFuture<'a, ()>;

    /// Append entity change records.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn add_entities<'a>(&'a self, records: &'a [EntityAuditRecord]) -> StoreFuture<'a, ()>;

    /// Load every record sharing `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn trail<'a>(&'a self, correlation_id: &'a str) -> StoreFuture<'a, AuditTrail>;
}

/// Default bound on a single audit write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// `SQLite`-backed audit store.
///
/// Every write is bounded by a timeout. A handler nested inside an open
/// business transaction may find the pool's connections held or the
/// database locked; its audit writes then give up instead of stalling the
/// business path.
#[derive(Clone)]
pub struct SqliteAuditStore {
    requests: RequestRepo,
    handlers: HandlerRepo,
    entities: EntityRepo,
    write_timeout: Duration,
}

impl SqliteAuditStore {
    /// Create a store over the shared pool.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            requests: RequestRepo::new(Arc::clone(&db)),
            handlers: HandlerRepo::new(Arc::clone(&db)),
            entities: EntityRepo::new(db),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Replace the bound applied to each write.
    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    fn bounded<'a, F>(&self, write: F) -> StoreFuture<'a, ()>
    where
        F: Future<Output = Result<()>> + Send + 'a,
    {
        let limit = self.write_timeout;
        Box::pin(async move {
            timeout(limit, write).await.unwrap_or_else(|_| {
                Err(AppError::Db(format!(
                    "audit write timed out after {}ms",
                    limit.as_millis()
                )))
            })
        })
    }

    /// Queue entity records inside an open business transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if an insert fails; the transaction is left
    /// open for the caller to decide on.
    pub async fn add_entities_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        records: &[EntityAuditRecord],
    ) -> Result<()> {
        for record in records {
            entity_repo::insert_with(&mut **tx, record).await?;
        }
        Ok(())
    }

    /// Entity records nested under handler `handler_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn entities_by_handler(&self, handler_id: &str) -> Result<Vec<EntityAuditRecord>> {
        self.entities.list_by_handler(handler_id).await
    }

    /// Request records sharing `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn requests_by_correlation(&self, correlation_id: &str) -> Result<Vec<RequestAuditRecord>> {
        self.requests.list_by_correlation(correlation_id).await
    }

    /// Handler records sharing `correlation_id`, in start order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn handlers_by_correlation(&self, correlation_id: &str) -> Result<Vec<HandlerAuditRecord>> {
        self.handlers.list_by_correlation(correlation_id).await
    }

    /// Entity records sharing `correlation_id`, in capture order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn entities_by_correlation(&self, correlation_id: &str) -> Result<Vec<EntityAuditRecord>> {
        self.entities.list_by_correlation(correlation_id).await
    }
}

impl AuditStore for SqliteAuditStore {
    fn add_request<'a>(&'a self, record: &'a RequestAuditRecord) -> StoreFuture<'a, ()> {
        self.bounded(self.requests.insert(record))
    }

    fn complete_request<'a>(&'a self, record: &'a RequestAuditRecord) -> StoreFuture<'a, ()> {
        self.bounded(self.requests.complete(record))
    }

    fn add_handler<'a>(&'a self, record: &'a HandlerAuditRecord) -> StoreFuture<'a, ()> {
        self.bounded(self.handlers.insert(record))
    }

    fn complete_handler<'a>(&'a self, record: &'a HandlerAuditRecord) -> StoreFuture<'a, ()> {
        self.bounded(self.handlers.complete(record))
    }

    fn mark_handler_failed<'a>(&'a self, id: &'a str, message: &'a str) -> StoreFuture<'a, ()> {
        self.bounded(self.handlers.mark_failed(id, message))
    }

    fn add_entities<'a>(&'a self, records: &'a [EntityAuditRecord]) -> StoreFuture<'a, ()> {
        self.bounded(self.entities.insert_all(records))
    }

    fn trail<'a>(&'a self, correlation_id: &'a str) -> StoreFuture<'a, AuditTrail> {
        Box::pin(async move {
            Ok(AuditTrail {
                requests: self.requests_by_correlation(correlation_id).await?,
                handlers: self.handlers_by_correlation(correlation_id).await?,
                entities: self.entities_by_correlation(correlation_id).await?,
            })
        })
    }
}

/// In-process audit store, used by tests and embedders without a database.
///
/// [`MemoryAuditStore::set_failing`] makes every write fail, for exercising
/// the recorders' swallow-and-log paths.
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    requests: Mutex<Vec<RequestAuditRecord>>,
    handlers: Mutex<Vec<HandlerAuditRecord>>,
    entities: Mutex<Vec<EntityAuditRecord>>,
    failing: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryAuditStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle simulated write failures.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Snapshot of stored request records.
    #[must_use]
    pub fn requests(&self) -> Vec<RequestAuditRecord> {
        lock(&self.requests).clone()
    }

    /// Snapshot of stored handler records.
    #[must_use]
    pub fn handlers(&self) -> Vec<HandlerAuditRecord> {
        lock(&self.handlers).clone()
    }

    /// Snapshot of stored entity records.
    #[must_use]
    pub fn entities(&self) -> Vec<EntityAuditRecord> {
        lock(&self.entities).clone()
    }

    fn check_writable(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(AppError::Db("audit store unavailable".into()))
        } else {
            Ok(())
        }
    }

    fn replace_request(&self, record: &RequestAuditRecord) -> Result<()> {
        self.check_writable()?;
        let mut requests = lock(&self.requests);
        let slot = requests
            .iter_mut()
            .find(|r| r.id == record.id)
            .ok_or_else(|| AppError::NotFound(format!("request audit record {} not found", record.id)))?;
        *slot = record.clone();
        Ok(())
    }

    fn replace_handler(&self, record: &HandlerAuditRecord) -> Result<()> {
        self.check_writable()?;
        let mut handlers = lock(&self.handlers);
        let slot = handlers
            .iter_mut()
            .find(|h| h.id == record.id)
            .ok_or_else(|| AppError::NotFound(format!("handler audit record {} not found", record.id)))?;
        *slot = record.clone();
        Ok(())
    }

    fn fail_handler(&self, id: &str, message: &str) -> Result<()> {
        self.check_writable()?;
        let mut handlers = lock(&self.handlers);
        let slot = handlers
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or_else(|| AppError::NotFound(format!("handler audit record {id} not found")))?;
        slot.mark_as_failed(message);
        Ok(())
    }
}

impl AuditStore for MemoryAuditStore {
    fn add_request<'a>(&'a self, record: &'a RequestAuditRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            lock(&self.requests).push(record.clone());
            Ok(())
        })
    }

    fn complete_request<'a>(&'a self, record: &'a RequestAuditRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.replace_request(record) })
    }

    fn add_handler<'a>(&'a self, record: &'a HandlerAuditRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            lock(&self.handlers).push(record.clone());
            Ok(())
        })
    }

    fn complete_handler<'a>(&'a self, record: &'a HandlerAuditRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.replace_handler(record) })
    }

    fn mark_handler_failed<'a>(&'a self, id: &'a str, message: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.fail_handler(id, message) })
    }

    fn add_entities<'a>(&'a self, records: &'a [EntityAuditRecord]) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.check_writable()?;
            lock(&self.entities).extend_from_slice(records);
            Ok(())
        })
    }

    fn trail<'a>(&'a self, correlation_id: &'a str) -> StoreFuture<'a, AuditTrail> {
        Box::pin(async move {
            Ok(AuditTrail {
                requests: lock(&self.requests)
                    .iter()
                    .filter(|r| r.correlation_id == correlation_id)
                    .cloned()
                    .collect(),
                handlers: lock(&self.handlers)
                    .iter()
                    .filter(|h| h.correlation_id == correlation_id)
                    .cloned()
                    .collect(),
                entities: lock(&self.entities)
                    .iter()
                    .filter(|e| e.correlation_id.as_deref() == Some(correlation_id))
                    .cloned()
                    .collect(),
            })
        })
    }
}
