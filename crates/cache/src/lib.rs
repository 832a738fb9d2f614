//! In-memory cache for orders by order_uid, with thread-safe access.
//!
//! The cache is process-local and write-through: the service layer populates
//! it after every successful persist, and replaces it wholesale at startup
//! from the store. Capacity is unbounded and entries are never evicted.

use std::collections::HashMap;

use model::Order;
use tokio::sync::RwLock;

/// Thread-safe in-memory order cache.
///
/// Shared across the consumer, the service layer and the HTTP middleware as
/// `Arc<OrderCache>`. Readers never observe a partially rebuilt map:
/// `restore` builds the replacement off to the side and swaps it in under
/// the write lock.
#[derive(Debug, Default)]
pub struct OrderCache {
    inner: RwLock<HashMap<String, Order>>,
}

impl OrderCache {
    /// Create a new, empty order cache.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Get a cloned order by its order_uid (None if not cached).
    pub async fn get(&self, order_uid: &str) -> Option<Order> {
        let map = self.inner.read().await;
        map.get(order_uid).cloned()
    }

    /// Insert or update an order in the cache.
    pub async fn set(&self, order: Order) {
        let mut map = self.inner.write().await;
        map.insert(order.order_uid.clone(), order);
    }

    /// Replace the whole cache content with the given orders.
    ///
    /// The new map is fully built before the lock is taken, so concurrent
    /// readers see either the old content or the new one, never a mix.
    pub async fn restore(&self, orders: Vec<Order>) {
        let items: HashMap<String, Order> = orders
            .into_iter()
            .map(|order| (order.order_uid.clone(), order))
            .collect();

        let mut map = self.inner.write().await;
        *map = items;
    }

    /// Number of cached orders.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// True when nothing is cached.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use model::{Delivery, Item, Order, Payment};

    fn sample_order(uid: &str) -> Order {
        Order {
            order_uid: uid.to_string(),
            track_number: "track123".to_string(),
            entry: "test".to_string(),
            delivery: Delivery {
                name: "Test User".to_string(),
                phone: "+1000000000".to_string(),
                zip: "0000".to_string(),
                city: "Test City".to_string(),
                address: "Street".to_string(),
                region: "Test Region".to_string(),
                email: "test@example.com".to_string(),
            },
            payment: Payment {
                transaction: "tx1".to_string(),
                request_id: String::new(),
                currency: "USD".to_string(),
                provider: "test".to_string(),
                amount: Some(100),
                payment_dt: 1637907727,
                bank: "bank".to_string(),
                delivery_cost: Some(0),
                goods_total: Some(100),
                custom_fee: Some(0),
            },
            items: vec![Item {
                chrt_id: 1,
                track_number: "track123".to_string(),
                price: 100,
                rid: "rid1".to_string(),
                name: "Item1".to_string(),
                sale: 0,
                size: "L".to_string(),
                total_price: Some(100),
                nm_id: 123,
                brand: "brand".to_string(),
                status: 1,
            }],
            locale: "en".to_string(),
            internal_signature: String::new(),
            customer_id: "cust1".to_string(),
            delivery_service: "svc".to_string(),
            shardkey: "shard".to_string(),
            sm_id: 1,
            date_created: chrono::Utc::now(),
            oof_shard: "oof".to_string(),
        }
    }

    #[tokio::test]
    async fn empty_cache_misses() {
        let cache = OrderCache::new();
        assert!(cache.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn set_and_get_order() {
        let cache = OrderCache::new();
        let order = sample_order("order123");
        cache.set(order.clone()).await;
        let got = cache.get("order123").await;
        assert_eq!(got, Some(order));
    }

    #[tokio::test]
    async fn set_overwrites_existing_entry() {
        let cache = OrderCache::new();
        let mut order = sample_order("order123");
        cache.set(order.clone()).await;

        order.locale = "ru".to_string();
        cache.set(order.clone()).await;
        let got = cache.get("order123").await.unwrap();
        assert_eq!(got.locale, "ru");
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn restore_replaces_previous_content() {
        let cache = OrderCache::new();
        cache.set(sample_order("old")).await;

        cache
            .restore(vec![sample_order("a"), sample_order("b")])
            .await;

        assert!(cache.get("old").await.is_none());
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_some());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn restore_with_empty_input_truncates() {
        let cache = OrderCache::new();
        cache.set(sample_order("old")).await;
        cache.restore(Vec::new()).await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_get_and_set_never_tear() {
        let cache = Arc::new(OrderCache::new());
        let order = sample_order("shared");
        cache.set(order.clone()).await;

        let writer = {
            let cache = cache.clone();
            let order = order.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    cache.set(order.clone()).await;
                }
            })
        };
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    // Either the pre- or post-set value, always complete.
                    let got = cache.get("shared").await.unwrap();
                    assert_eq!(got.order_uid, "shared");
                    assert_eq!(got.items.len(), 1);
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
    }
}
