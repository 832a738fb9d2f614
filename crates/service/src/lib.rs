//! Business logic layer for order management.
//!
//! [`OrderUseCase`] ties the store and the cache together as a write-through
//! pair: an order enters the cache only after the store accepted it, and a
//! read that had to touch the store leaves a copy behind for the next read.
//! The [`OrderService`] trait is the seam consumed by the message consumer
//! and the HTTP layer.

use std::sync::Arc;

use async_trait::async_trait;
use cache::OrderCache;
use model::Order;
use repository::{OrderRepository, RepositoryError};
use thiserror::Error;
use tracing::{info, instrument};
use validator::ValidationError;

/// The error type for all [`OrderService`] operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The order is structurally invalid; nothing was persisted.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The store rejected or failed the operation.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl ServiceError {
    /// True when the underlying cause is a missing aggregate.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Repository(RepositoryError::NotFound))
    }
}

/// Business operations over orders.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Validates and atomically persists the order, then caches it.
    ///
    /// On any failure the cache is left untouched and the error propagates.
    async fn save(&self, order: &Order) -> Result<(), ServiceError>;

    /// Loads one full aggregate from the store and caches it.
    async fn find_by_id(&self, order_uid: &str) -> Result<Order, ServiceError>;

    /// Loads every stored aggregate. Does not touch the cache.
    async fn find_all(&self) -> Result<Vec<Order>, ServiceError>;
}

/// Write-through implementation of [`OrderService`] over a repository and
/// the shared in-memory cache.
pub struct OrderUseCase<R> {
    repository: R,
    cache: Arc<OrderCache>,
}

impl<R> OrderUseCase<R>
where
    R: OrderRepository,
{
    pub fn new(repository: R, cache: Arc<OrderCache>) -> Self {
        Self { repository, cache }
    }

    /// Warm the cache from the store, replacing whatever it held.
    ///
    /// Called once at startup after migrations have run. A failure here is
    /// reported to the caller, who may continue with a cold cache.
    pub async fn restore_cache(&self) -> Result<(), ServiceError> {
        let orders = self.repository.select_all().await?;
        let count = orders.len();
        self.cache.restore(orders).await;
        info!(orders = count, "cache restored from store");
        Ok(())
    }
}

#[async_trait]
impl<R> OrderService for OrderUseCase<R>
where
    R: OrderRepository,
{
    #[instrument(skip(self, order), fields(order_uid = %order.order_uid))]
    async fn save(&self, order: &Order) -> Result<(), ServiceError> {
        validator::validate(order)?;
        self.repository.insert(order).await?;
        self.cache.set(order.clone()).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, order_uid: &str) -> Result<Order, ServiceError> {
        let order = self.repository.select_by_id(order_uid).await?;
        self.cache.set(order.clone()).await;
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn find_all(&self) -> Result<Vec<Order>, ServiceError> {
        Ok(self.repository.select_all().await?)
    }
}
