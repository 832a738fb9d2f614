//! Synthetic order producer.
//!
//! Generates random but structurally valid orders and publishes them to the
//! order subject. Used to seed a local stack and by the load-style tests;
//! the ingestion pipeline treats these messages like any other.

use anyhow::{Context, Result};
use app_config::AppConfig;
use async_nats::jetstream;
use chrono::Utc;
use fake::faker::address::en::{CityName, StateName, StreetName, ZipCode};
use fake::faker::company::en::{Buzzword, CompanyName};
use fake::faker::internet::en::SafeEmail;
use fake::faker::name::en::Name;
use fake::faker::phone_number::en::PhoneNumber;
use fake::Fake;
use model::{Delivery, Item, Order, Payment};
use rand::seq::SliceRandom;
use std::time::SystemTime;
use tracing::info;
use uuid::Uuid;

/// Generates `count` test orders and publishes them to the configured
/// subject, waiting for the server to acknowledge each one.
///
/// # Returns
/// The UIDs of the published orders, in publish order.
pub async fn produce_test_orders(count: usize) -> Result<Vec<String>> {
    let config = AppConfig::load().context("Failed to load config")?;

    let client = async_nats::ConnectOptions::new()
        .name("order-producer")
        .connect(config.nats_url.as_str())
        .await
        .context("Failed to connect to nats")?;
    let jetstream = jetstream::new(client);

    // Make sure the stream exists even when the producer runs first.
    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.nats_cluster.clone(),
            subjects: vec![config.nats_subject.clone()],
            ..Default::default()
        })
        .await
        .context("Failed to look up or create stream")?;

    let mut order_uids = Vec::with_capacity(count);
    for _ in 0..count {
        let order = generate_order();
        let payload = serde_json::to_vec(&order).context("Failed to serialize order")?;

        let ack = jetstream
            .publish(config.nats_subject.clone(), payload.into())
            .await
            .context("Failed to publish order")?;
        ack.await.context("Publish was not acknowledged")?;

        order_uids.push(order.order_uid);
    }

    info!(count, subject = %config.nats_subject, "test orders published");
    Ok(order_uids)
}

/// Builds one random order that passes structural validation.
fn generate_order() -> Order {
    let mut rng = rand::thread_rng();
    let order_uid = Uuid::new_v4().to_string();
    let track_number = format!("TRACK{}", (100_000..999_999).fake::<u32>());

    let delivery = Delivery {
        name: Name().fake(),
        phone: PhoneNumber().fake(),
        zip: ZipCode().fake(),
        city: CityName().fake(),
        address: StreetName().fake(),
        region: StateName().fake(),
        email: SafeEmail().fake(),
    };

    let payment = Payment {
        transaction: Uuid::new_v4().to_string(),
        request_id: String::new(),
        currency: ["USD", "EUR", "GBP", "JPY"]
            .choose(&mut rng)
            .copied()
            .unwrap_or("USD")
            .to_string(),
        provider: CompanyName().fake(),
        amount: Some((100..10_000).fake()),
        payment_dt: SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(1),
        bank: CompanyName().fake(),
        delivery_cost: Some((0..500).fake()),
        goods_total: Some((50..5_000).fake()),
        custom_fee: Some((0..100).fake()),
    };

    let item_count = (1..5).fake::<usize>();
    let mut items = Vec::with_capacity(item_count);
    for _ in 0..item_count {
        items.push(Item {
            chrt_id: (1_000..9_999).fake(),
            track_number: track_number.clone(),
            price: (100..1_000).fake(),
            rid: Uuid::new_v4().to_string(),
            name: Buzzword().fake(),
            sale: (0..50).fake(),
            size: ["XS", "S", "M", "L", "XL"]
                .choose(&mut rng)
                .copied()
                .unwrap_or("M")
                .to_string(),
            total_price: Some((100..2_000).fake()),
            nm_id: (100_000..999_999).fake(),
            brand: CompanyName().fake(),
            status: (1..3).fake(),
        });
    }

    Order {
        order_uid,
        track_number,
        entry: "WBIL".to_string(),
        delivery,
        payment,
        items,
        locale: ["en", "ru", "de", "fr"]
            .choose(&mut rng)
            .copied()
            .unwrap_or("en")
            .to_string(),
        internal_signature: String::new(),
        customer_id: Uuid::new_v4().to_string(),
        delivery_service: CompanyName().fake(),
        shardkey: (1..10).fake::<u8>().to_string(),
        sm_id: (1..100).fake(),
        date_created: Utc::now(),
        oof_shard: (1..4).fake::<u8>().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_order_has_consistent_tracking() {
        let order = generate_order();

        assert!(!order.order_uid.is_empty());
        assert!(!order.items.is_empty());
        for item in &order.items {
            assert_eq!(item.track_number, order.track_number);
        }
    }

    #[test]
    fn generated_order_passes_validation() {
        for _ in 0..20 {
            let order = generate_order();
            assert_eq!(validator::validate(&order), Ok(()));
        }
    }

    #[test]
    fn generated_uids_are_unique() {
        let a = generate_order();
        let b = generate_order();
        assert_ne!(a.order_uid, b.order_uid);
    }
}
