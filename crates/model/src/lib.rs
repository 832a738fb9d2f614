use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery - recipient and address details for one order.
///
/// Every field is required on the wire; the validator rejects empty values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Recipient's full name
    pub name: String,
    /// Contact phone number
    pub phone: String,
    /// Postal code
    pub zip: String,
    /// City name
    pub city: String,
    /// Street address
    pub address: String,
    /// Region or state
    pub region: String,
    /// Contact email address
    pub email: String,
}

/// Payment - transaction details for one order.
///
/// The monetary fields are `Option` because the wire contract distinguishes
/// a missing amount from an explicit zero: zero is a legal value, absence is
/// a validation failure reported against the field. Deserialization therefore
/// never fails on a missing amount; the validator does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Payment {
    /// Unique transaction identifier
    pub transaction: String,
    /// Request identifier, may be absent
    #[serde(default)]
    pub request_id: String,
    /// Currency code (e.g. USD, EUR)
    pub currency: String,
    /// Payment service provider name
    pub provider: String,
    /// Total payment amount
    pub amount: Option<i32>,
    /// Payment date/time as Unix timestamp
    pub payment_dt: i64,
    /// Bank name or identifier
    pub bank: String,
    /// Cost of delivery
    pub delivery_cost: Option<i32>,
    /// Total cost of goods without delivery
    pub goods_total: Option<i32>,
    /// Any additional fees
    pub custom_fee: Option<i32>,
}

/// Item - a single product line in an order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Item {
    /// Chart ID, identifies the item within the chart
    pub chrt_id: i32,
    /// Tracking number for the item shipment
    pub track_number: String,
    /// Original price of the item
    pub price: i32,
    /// Row identifier
    pub rid: String,
    /// Product name
    pub name: String,
    /// Discount percentage
    pub sale: i32,
    /// Size, numeric or descriptive ("S", "M", "L")
    pub size: String,
    /// Final price after discounts; may be derived downstream and absent
    pub total_price: Option<i32>,
    /// Nomenclature ID, product catalog identifier
    pub nm_id: i32,
    /// Brand name
    pub brand: String,
    /// Item status code
    pub status: i32,
}

/// Order - the aggregate root.
///
/// Immutable once accepted: the pipeline only ever creates orders, it never
/// updates or deletes them. `order_uid` identifies the whole aggregate and is
/// the primary key across all four persisted tables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Order {
    /// Unique identifier for the order
    pub order_uid: String,
    /// Tracking number for the entire order
    pub track_number: String,
    /// Entry point identifier
    pub entry: String,
    /// Delivery information
    pub delivery: Delivery,
    /// Payment details
    pub payment: Payment,
    /// Product lines, wire order preserved; at least one is required
    pub items: Vec<Item>,
    /// Language/locale code
    pub locale: String,
    /// Internal signature, may be absent
    #[serde(default)]
    pub internal_signature: String,
    /// Customer identifier
    pub customer_id: String,
    /// Delivery service provider
    pub delivery_service: String,
    /// Sharding key
    pub shardkey: String,
    /// Service manager identifier
    pub sm_id: i32,
    /// Order creation timestamp (RFC3339 on the wire)
    pub date_created: DateTime<Utc>,
    /// Out-of-stock shard identifier
    pub oof_shard: String,
}

#[cfg(test)]
mod tests {
    use super::Order;
    use chrono::{TimeZone, Utc};

    const SAMPLE: &str = r#"
    {
       "order_uid": "b563feb7b2b84b6test",
       "track_number": "WBILMTESTTRACK",
       "entry": "WBIL",
       "delivery": {
          "name": "Test Testov",
          "phone": "+9720000000",
          "zip": "2639809",
          "city": "Kiryat Mozkin",
          "address": "Ploshad Mira 15",
          "region": "Kraiot",
          "email": "test@gmail.com"
       },
       "payment": {
          "transaction": "b563feb7b2b84b6test",
          "request_id": "",
          "currency": "USD",
          "provider": "wbpay",
          "amount": 1817,
          "payment_dt": 1637907727,
          "bank": "alpha",
          "delivery_cost": 1500,
          "goods_total": 317,
          "custom_fee": 0
       },
       "items": [
          {
             "chrt_id": 9934930,
             "track_number": "WBILMTESTTRACK",
             "price": 453,
             "rid": "ab4219087a764ae0btest",
             "name": "Mascaras",
             "sale": 30,
             "size": "0",
             "total_price": 317,
             "nm_id": 2389212,
             "brand": "Vivienne Sabo",
             "status": 202
          }
       ],
       "locale": "en",
       "internal_signature": "",
       "customer_id": "test",
       "delivery_service": "meest",
       "shardkey": "9",
       "sm_id": 99,
       "date_created": "2021-11-26T06:22:19Z",
       "oof_shard": "1"
    }
    "#;

    #[test]
    fn deserialize_order_from_json() {
        let order: Order = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(order.order_uid, "b563feb7b2b84b6test");
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].chrt_id, 9934930);
        assert_eq!(order.payment.amount, Some(1817));
        assert_eq!(order.payment.custom_fee, Some(0));

        let expected = Utc.with_ymd_and_hms(2021, 11, 26, 6, 22, 19).unwrap();
        assert_eq!(order.date_created, expected);
        assert_eq!(order.date_created.to_rfc3339(), "2021-11-26T06:22:19+00:00");
    }

    #[test]
    fn serialize_roundtrip_preserves_order() {
        let order: Order = serde_json::from_str(SAMPLE).unwrap();
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(order, back);
    }

    #[test]
    fn missing_monetary_field_decodes_as_none() {
        let json = SAMPLE.replacen("\"amount\": 1817,", "", 1);
        let order: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(order.payment.amount, None);
        assert_eq!(order.payment.goods_total, Some(317));
    }

    #[test]
    fn null_monetary_field_decodes_as_none() {
        let json = SAMPLE.replacen("\"custom_fee\": 0", "\"custom_fee\": null", 1);
        let order: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(order.payment.custom_fee, None);
    }

    #[test]
    fn missing_request_id_defaults_to_empty() {
        let json = SAMPLE.replacen("\"request_id\": \"\",", "", 1);
        let order: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(order.payment.request_id, "");
    }

    #[test]
    fn missing_item_field_fails_to_decode() {
        let json = SAMPLE.replacen("\"rid\": \"ab4219087a764ae0btest\",", "", 1);
        assert!(serde_json::from_str::<Order>(&json).is_err());
    }
}
