//! # Data repository layer
//!
//! Persistence of the whole order aggregate over four related tables.
//! A single trait covers the store: one transactional insert and two
//! hydrating reads. The PostgreSQL implementation batches the insert as
//! prepared statements pipelined in one round trip and reconstructs
//! aggregates with a single joined query per read.

use async_trait::async_trait;
use deadpool_postgres::{Pool, PoolError};
use futures::future::try_join_all;
use model::{Delivery, Item, Order, Payment};
use thiserror::Error;
use tokio_postgres::Row;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;

/// Errors surfaced by the store.
///
/// The split matters to the ingestion pipeline: a [`Duplicate`] is expected
/// under at-least-once delivery and only recorded, a [`Transient`] failure
/// may succeed on broker redelivery, and a [`Fatal`] one (schema drift,
/// constraint mismatch) will not.
///
/// [`Duplicate`]: RepositoryError::Duplicate
/// [`Transient`]: RepositoryError::Transient
/// [`Fatal`]: RepositoryError::Fatal
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// An order with this UID is already persisted.
    #[error("order {0} already exists")]
    Duplicate(String),
    /// No result found.
    #[error("order not found")]
    NotFound,
    /// Connection, lock or resource trouble; retryable from outside.
    #[error("transient database error: {0}")]
    Transient(#[source] tokio_postgres::Error),
    /// Anything the database will keep rejecting.
    #[error("database error: {0}")]
    Fatal(#[source] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),
    /// The aggregated items column did not decode back into items.
    #[error("corrupted items payload: {0}")]
    Items(#[from] serde_json::Error),
}

/// Repository interface for the order aggregate.
///
/// Implementations must guarantee that `insert` is atomic across all four
/// tables and that reads return fully hydrated aggregates.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Persist the order and all related rows in one transaction.
    async fn insert(&self, order: &Order) -> Result<(), RepositoryError>;

    /// Fetch one full aggregate; [`RepositoryError::NotFound`] when absent.
    async fn select_by_id(&self, order_uid: &str) -> Result<Order, RepositoryError>;

    /// Fetch every stored aggregate.
    async fn select_all(&self) -> Result<Vec<Order>, RepositoryError>;
}

const INSERT_ORDER: &str = r#"
    INSERT INTO orders (
        order_uid, track_number, entry, locale, internal_signature,
        customer_id, delivery_service, shardkey, sm_id, date_created, oof_shard
    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
"#;

const INSERT_DELIVERY: &str = r#"
    INSERT INTO deliveries (order_uid, name, phone, zip, city, address, region, email)
    VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
"#;

const INSERT_PAYMENT: &str = r#"
    INSERT INTO payments (
        order_uid, transaction, request_id, currency, provider, amount,
        payment_dt, bank, delivery_cost, goods_total, custom_fee
    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
"#;

const INSERT_ITEM: &str = r#"
    INSERT INTO items (
        order_uid, chrt_id, track_number, price, rid, name, sale, size,
        total_price, nm_id, brand, status
    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
"#;

// Hydrates the aggregate in one statement: scalar joins for the one-to-one
// tables, a lateral json_agg for the item lines in insertion order.
const SELECT_ORDER: &str = r#"
    SELECT o.order_uid, o.track_number, o.entry, o.locale, o.internal_signature,
           o.customer_id, o.delivery_service, o.shardkey, o.sm_id, o.date_created, o.oof_shard,
           d.name, d.phone, d.zip, d.city, d.address, d.region, d.email,
           p.transaction, p.request_id, p.currency, p.provider, p.amount, p.payment_dt,
           p.bank, p.delivery_cost, p.goods_total, p.custom_fee,
           i.items
    FROM orders o
    JOIN deliveries d ON d.order_uid = o.order_uid
    JOIN payments p ON p.order_uid = o.order_uid
    CROSS JOIN LATERAL (
        SELECT COALESCE(json_agg(json_build_object(
            'chrt_id', it.chrt_id,
            'track_number', it.track_number,
            'price', it.price,
            'rid', it.rid,
            'name', it.name,
            'sale', it.sale,
            'size', it.size,
            'total_price', it.total_price,
            'nm_id', it.nm_id,
            'brand', it.brand,
            'status', it.status
        ) ORDER BY it.id), '[]'::json) AS items
        FROM items it
        WHERE it.order_uid = o.order_uid
    ) i
"#;

/// PostgreSQL implementation of [`OrderRepository`].
pub struct PgOrderRepository {
    pool: Pool,
}

impl PgOrderRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    /// Saves the aggregate atomically.
    ///
    /// The four statements are prepared inside the transaction and their
    /// executions (one order, one delivery, one payment, N items) are
    /// pipelined together, so the whole write costs a single round trip
    /// before commit. Any failure drops the transaction, which rolls it
    /// back; partial writes cannot survive.
    async fn insert(&self, order: &Order) -> Result<(), RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client
            .transaction()
            .await
            .map_err(RepositoryError::Fatal)?;

        let (order_stmt, delivery_stmt, payment_stmt, item_stmt) = tokio::try_join!(
            tx.prepare(INSERT_ORDER),
            tx.prepare(INSERT_DELIVERY),
            tx.prepare(INSERT_PAYMENT),
            tx.prepare(INSERT_ITEM),
        )
        .map_err(classify)?;

        let delivery = &order.delivery;
        let payment = &order.payment;

        let order_params: [&(dyn ToSql + Sync); 11] = [
            &order.order_uid,
            &order.track_number,
            &order.entry,
            &order.locale,
            &order.internal_signature,
            &order.customer_id,
            &order.delivery_service,
            &order.shardkey,
            &order.sm_id,
            &order.date_created,
            &order.oof_shard,
        ];
        let delivery_params: [&(dyn ToSql + Sync); 8] = [
            &order.order_uid,
            &delivery.name,
            &delivery.phone,
            &delivery.zip,
            &delivery.city,
            &delivery.address,
            &delivery.region,
            &delivery.email,
        ];
        let payment_params: [&(dyn ToSql + Sync); 11] = [
            &order.order_uid,
            &payment.transaction,
            &payment.request_id,
            &payment.currency,
            &payment.provider,
            &payment.amount,
            &payment.payment_dt,
            &payment.bank,
            &payment.delivery_cost,
            &payment.goods_total,
            &payment.custom_fee,
        ];
        let item_params: Vec<[&(dyn ToSql + Sync); 12]> = order
            .items
            .iter()
            .map(|it| {
                [
                    &order.order_uid as &(dyn ToSql + Sync),
                    &it.chrt_id,
                    &it.track_number,
                    &it.price,
                    &it.rid,
                    &it.name,
                    &it.sale,
                    &it.size,
                    &it.total_price,
                    &it.nm_id,
                    &it.brand,
                    &it.status,
                ]
            })
            .collect();

        let mut inserts = Vec::with_capacity(3 + item_params.len());
        inserts.push(tx.execute(&order_stmt, &order_params));
        inserts.push(tx.execute(&delivery_stmt, &delivery_params));
        inserts.push(tx.execute(&payment_stmt, &payment_params));
        for params in &item_params {
            inserts.push(tx.execute(&item_stmt, params));
        }

        try_join_all(inserts).await.map_err(|e| {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                RepositoryError::Duplicate(order.order_uid.clone())
            } else {
                classify(e)
            }
        })?;

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn select_by_id(&self, order_uid: &str) -> Result<Order, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!("{SELECT_ORDER} WHERE o.order_uid = $1");
        let row = client
            .query_opt(query.as_str(), &[&order_uid])
            .await
            .map_err(classify)?;

        match row {
            Some(row) => hydrate(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn select_all(&self) -> Result<Vec<Order>, RepositoryError> {
        let client = self.pool.get().await?;
        let query = format!("{SELECT_ORDER} ORDER BY o.order_uid");
        let rows = client.query(query.as_str(), &[]).await.map_err(classify)?;

        rows.iter().map(hydrate).collect()
    }
}

fn hydrate(row: &Row) -> Result<Order, RepositoryError> {
    let items_json: serde_json::Value = row.get("items");
    let items: Vec<Item> = serde_json::from_value(items_json)?;

    Ok(Order {
        order_uid: row.get("order_uid"),
        track_number: row.get("track_number"),
        entry: row.get("entry"),
        delivery: Delivery {
            name: row.get("name"),
            phone: row.get("phone"),
            zip: row.get("zip"),
            city: row.get("city"),
            address: row.get("address"),
            region: row.get("region"),
            email: row.get("email"),
        },
        payment: Payment {
            transaction: row.get("transaction"),
            request_id: row.get("request_id"),
            currency: row.get("currency"),
            provider: row.get("provider"),
            amount: Some(row.get("amount")),
            payment_dt: row.get("payment_dt"),
            bank: row.get("bank"),
            delivery_cost: Some(row.get("delivery_cost")),
            goods_total: Some(row.get("goods_total")),
            custom_fee: Some(row.get("custom_fee")),
        },
        items,
        locale: row.get("locale"),
        internal_signature: row.get("internal_signature"),
        customer_id: row.get("customer_id"),
        delivery_service: row.get("delivery_service"),
        shardkey: row.get("shardkey"),
        sm_id: row.get("sm_id"),
        date_created: row.get("date_created"),
        oof_shard: row.get("oof_shard"),
    })
}

fn classify(err: tokio_postgres::Error) -> RepositoryError {
    if is_transient(&err) {
        RepositoryError::Transient(err)
    } else {
        RepositoryError::Fatal(err)
    }
}

// Connection loss (class 08), rollbacks the server asks us to retry
// (class 40), resource exhaustion (53) and operator intervention (57).
fn is_transient(err: &tokio_postgres::Error) -> bool {
    if err.is_closed() {
        return true;
    }
    match err.code() {
        Some(state) => matches!(&state.code()[..2], "08" | "40" | "53" | "57"),
        None => false,
    }
}
