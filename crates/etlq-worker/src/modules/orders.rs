//! `legacy_orders` -> `orders`
//!
//! Drops cancelled orders, computes the order total and keeps the line items
//! as a JSON array.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;

use crate::transfer::helpers::extract_json_object;
use crate::transfer::{
    ColumnMapping, DestinationRow, FieldValue, Row, SourceRow, Transform, TransferSpec,
};

pub const SOURCE_TABLE: &str = "legacy_orders";
pub const DESTINATION_TABLE: &str = "orders";

const CANCELLED: &str = "X";

fn column_map() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::same("id"),
        ColumnMapping::new("CustomerId", "customer_id"),
        ColumnMapping::new("Quantity", "quantity"),
        ColumnMapping::new("UnitPrice", "total"),
        ColumnMapping::new("Status", "status"),
        ColumnMapping::new("Payload", "items"),
        ColumnMapping::new("OrderedAt", "ordered_at"),
    ]
}

fn status_name(code: &str) -> &'static str {
    match code.trim() {
        "N" => "new",
        "P" => "paid",
        "S" => "shipped",
        _ => "unknown",
    }
}

/// Line items live in a free-text payload column, sometimes wrapped in noise
fn line_items(payload: Option<&FieldValue>) -> Value {
    let parsed = match payload {
        Some(FieldValue::Json(value)) => Some(value.clone()),
        Some(FieldValue::Text(text)) => extract_json_object(text),
        _ => None,
    };

    parsed
        .and_then(|mut value| value.get_mut("items").map(Value::take))
        .filter(Value::is_array)
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

struct OrderTransform;

impl OrderTransform {
    fn reshape(row: &SourceRow) -> anyhow::Result<Option<DestinationRow>> {
        let id = row.id().context("order row without an integer id")?;
        let status = row.get("Status").and_then(FieldValue::as_str).unwrap_or("");

        if status.trim() == CANCELLED {
            return Ok(None);
        }

        let quantity = row
            .get("Quantity")
            .and_then(FieldValue::as_i64)
            .with_context(|| format!("order {} has no quantity", id))?;
        let unit_price = row
            .get("UnitPrice")
            .and_then(FieldValue::as_f64)
            .with_context(|| format!("order {} has no unit price", id))?;
        let total = (quantity as f64 * unit_price * 100.0).round() / 100.0;

        Ok(Some(
            Row::new()
                .with("id", id)
                .with("customer_id", row.get("CustomerId").cloned().unwrap_or(FieldValue::Null))
                .with("quantity", quantity)
                .with("total", total)
                .with("status", status_name(status))
                .with("items", line_items(row.get("Payload")))
                .with("ordered_at", row.get("OrderedAt").cloned().unwrap_or(FieldValue::Null)),
        ))
    }
}

#[async_trait]
impl Transform for OrderTransform {
    async fn transform(&self, rows: Vec<SourceRow>) -> anyhow::Result<Vec<DestinationRow>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(order) = Self::reshape(row)? {
                out.push(order);
            }
        }
        Ok(out)
    }
}

pub fn spec() -> TransferSpec {
    TransferSpec::new(SOURCE_TABLE, DESTINATION_TABLE, column_map(), Arc::new(OrderTransform))
}
