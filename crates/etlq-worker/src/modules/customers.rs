//! `legacy_customers` -> `customers`
//!
//! Renames the legacy PascalCase columns, normalizes e-mail addresses and
//! flattens HTML notes into plain text.

use std::sync::Arc;

use crate::transfer::helpers::{coalesce, html_to_plain_text, is_html};
use crate::transfer::{
    ColumnMapping, DestinationRow, FieldValue, FnTransform, Row, SourceRow, TransferSpec,
};

pub const SOURCE_TABLE: &str = "legacy_customers";
pub const DESTINATION_TABLE: &str = "customers";

fn column_map() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::same("id"),
        ColumnMapping::new("FullName", "name"),
        ColumnMapping::new("Email", "email"),
        ColumnMapping::new("Notes", "notes"),
        ColumnMapping::new("CreatedOn", "created_at"),
    ]
}

fn text_or_null(value: Option<String>) -> FieldValue {
    value
        .filter(|v| !v.is_empty())
        .map(FieldValue::Text)
        .unwrap_or(FieldValue::Null)
}

fn transform_row(row: &SourceRow) -> Option<DestinationRow> {
    let id = row.id()?;

    let name = row
        .get("FullName")
        .and_then(FieldValue::as_str)
        .map(|name| name.split_whitespace().collect::<Vec<_>>().join(" "));

    let email = row
        .get("Email")
        .and_then(FieldValue::as_str)
        .map(|email| email.trim().to_lowercase());

    let notes = row.get("Notes").and_then(FieldValue::as_str).map(|notes| {
        if is_html(notes) {
            html_to_plain_text(notes).trim().to_string()
        } else {
            notes.trim().to_string()
        }
    });

    Some(
        Row::new()
            .with("id", id)
            .with("name", text_or_null(name))
            .with("email", text_or_null(email))
            .with("notes", text_or_null(notes))
            .with(
                "created_at",
                coalesce([row.get("CreatedOn"), row.get("ModifiedOn")]),
            ),
    )
}

pub fn spec() -> TransferSpec {
    let transform = FnTransform::new(|rows: Vec<SourceRow>| async move {
        Ok::<_, anyhow::Error>(rows.iter().filter_map(transform_row).collect::<Vec<_>>())
    });

    TransferSpec::new(SOURCE_TABLE, DESTINATION_TABLE, column_map(), Arc::new(transform))
}
