//! Structural validation of decoded orders.
//!
//! Validation is table-driven: a list of field rules for the order and its
//! embedded delivery/payment, and a second list applied to every item. The
//! first failing rule wins and the error names the offending field. The
//! whole module is pure and safe to call from any number of tasks.

use model::{Item, Order};
use thiserror::Error;

/// A structural violation in a decoded order.
///
/// `field` uses the wire name of the offending field, with an `items[i].`
/// prefix for item-level rules.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid order: field '{field}' {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: &'static str,
}

impl ValidationError {
    fn new(field: impl Into<String>, reason: &'static str) -> Self {
        Self {
            field: field.into(),
            reason,
        }
    }
}

struct OrderRule {
    field: &'static str,
    reason: &'static str,
    ok: fn(&Order) -> bool,
}

struct ItemRule {
    field: &'static str,
    reason: &'static str,
    ok: fn(&Item) -> bool,
}

const REQUIRED: &str = "is required";
const NON_NEGATIVE: &str = "must be present and non-negative";

const ORDER_RULES: &[OrderRule] = &[
    OrderRule {
        field: "order_uid",
        reason: REQUIRED,
        ok: |o| !o.order_uid.is_empty(),
    },
    OrderRule {
        field: "track_number",
        reason: REQUIRED,
        ok: |o| !o.track_number.is_empty(),
    },
    OrderRule {
        field: "entry",
        reason: REQUIRED,
        ok: |o| !o.entry.is_empty(),
    },
    OrderRule {
        field: "locale",
        reason: REQUIRED,
        ok: |o| !o.locale.is_empty(),
    },
    OrderRule {
        field: "customer_id",
        reason: REQUIRED,
        ok: |o| !o.customer_id.is_empty(),
    },
    OrderRule {
        field: "delivery_service",
        reason: REQUIRED,
        ok: |o| !o.delivery_service.is_empty(),
    },
    OrderRule {
        field: "shardkey",
        reason: REQUIRED,
        ok: |o| !o.shardkey.is_empty(),
    },
    OrderRule {
        field: "oof_shard",
        reason: REQUIRED,
        ok: |o| !o.oof_shard.is_empty(),
    },
    OrderRule {
        field: "sm_id",
        reason: "must be a positive identifier",
        ok: |o| o.sm_id > 0,
    },
    OrderRule {
        field: "delivery.name",
        reason: REQUIRED,
        ok: |o| !o.delivery.name.is_empty(),
    },
    OrderRule {
        field: "delivery.phone",
        reason: REQUIRED,
        ok: |o| !o.delivery.phone.is_empty(),
    },
    OrderRule {
        field: "delivery.zip",
        reason: REQUIRED,
        ok: |o| !o.delivery.zip.is_empty(),
    },
    OrderRule {
        field: "delivery.city",
        reason: REQUIRED,
        ok: |o| !o.delivery.city.is_empty(),
    },
    OrderRule {
        field: "delivery.address",
        reason: REQUIRED,
        ok: |o| !o.delivery.address.is_empty(),
    },
    OrderRule {
        field: "delivery.region",
        reason: REQUIRED,
        ok: |o| !o.delivery.region.is_empty(),
    },
    OrderRule {
        field: "delivery.email",
        reason: "must be a valid email address",
        ok: |o| is_email(&o.delivery.email),
    },
    OrderRule {
        field: "payment.transaction",
        reason: REQUIRED,
        ok: |o| !o.payment.transaction.is_empty(),
    },
    OrderRule {
        field: "payment.currency",
        reason: REQUIRED,
        ok: |o| !o.payment.currency.is_empty(),
    },
    OrderRule {
        field: "payment.provider",
        reason: REQUIRED,
        ok: |o| !o.payment.provider.is_empty(),
    },
    OrderRule {
        field: "payment.bank",
        reason: REQUIRED,
        ok: |o| !o.payment.bank.is_empty(),
    },
    OrderRule {
        field: "payment.payment_dt",
        reason: "must be a positive timestamp",
        ok: |o| o.payment.payment_dt > 0,
    },
    OrderRule {
        field: "payment.amount",
        reason: NON_NEGATIVE,
        ok: |o| o.payment.amount.is_some_and(|v| v >= 0),
    },
    OrderRule {
        field: "payment.delivery_cost",
        reason: NON_NEGATIVE,
        ok: |o| o.payment.delivery_cost.is_some_and(|v| v >= 0),
    },
    OrderRule {
        field: "payment.goods_total",
        reason: NON_NEGATIVE,
        ok: |o| o.payment.goods_total.is_some_and(|v| v >= 0),
    },
    OrderRule {
        field: "payment.custom_fee",
        reason: NON_NEGATIVE,
        ok: |o| o.payment.custom_fee.is_some_and(|v| v >= 0),
    },
];

const ITEM_RULES: &[ItemRule] = &[
    ItemRule {
        field: "track_number",
        reason: REQUIRED,
        ok: |i| !i.track_number.is_empty(),
    },
    ItemRule {
        field: "rid",
        reason: REQUIRED,
        ok: |i| !i.rid.is_empty(),
    },
    ItemRule {
        field: "name",
        reason: REQUIRED,
        ok: |i| !i.name.is_empty(),
    },
    ItemRule {
        field: "size",
        reason: REQUIRED,
        ok: |i| !i.size.is_empty(),
    },
    ItemRule {
        field: "brand",
        reason: REQUIRED,
        ok: |i| !i.brand.is_empty(),
    },
    ItemRule {
        field: "price",
        reason: "must be non-negative",
        ok: |i| i.price >= 0,
    },
    ItemRule {
        field: "sale",
        reason: "must be non-negative",
        ok: |i| i.sale >= 0,
    },
];

// Exactly one '@', a non-empty local part, and a dotted domain whose labels
// are all non-empty.
fn is_email(s: &str) -> bool {
    let mut parts = s.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| !label.is_empty())
}

/// Checks a decoded order against the rule tables.
///
/// Returns the first violation found, order rules before item rules, items
/// in wire order.
pub fn validate(order: &Order) -> Result<(), ValidationError> {
    for rule in ORDER_RULES {
        if !(rule.ok)(order) {
            return Err(ValidationError::new(rule.field, rule.reason));
        }
    }

    if order.items.is_empty() {
        return Err(ValidationError::new(
            "items",
            "must contain at least one item",
        ));
    }

    for (idx, item) in order.items.iter().enumerate() {
        for rule in ITEM_RULES {
            if !(rule.ok)(item) {
                return Err(ValidationError::new(
                    format!("items[{idx}].{}", rule.field),
                    rule.reason,
                ));
            }
        }
    }

    Ok(())
}
