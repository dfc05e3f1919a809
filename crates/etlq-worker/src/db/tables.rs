//! Postgres source reader and destination writer
//!
//! Source rows are decoded into untyped [`Row`]s by column type. Destination
//! loads run in one transaction; each row's insert gets its own savepoint so a
//! primary-key collision can be rolled back and replaced by an update without
//! aborting the batch.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use etlq_common::logging::SQL_TARGET;
use sqlx::postgres::{PgArguments, PgColumn, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, PgPool, Postgres, Row as _, TypeInfo};
use tracing::debug;

use super::quote_ident;
use crate::error::{StoreError, StoreResult};
use crate::store::{DestinationWriter, LoadReport, SourceReader};
use crate::transfer::{shape_optional, FieldValue, Row, ShapedValue, ID_COLUMN};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// What the reader and loader need to know about a table
#[derive(Debug, Clone, Default)]
pub(crate) struct TableInfo {
    /// Column names in table order
    pub columns: Vec<String>,
    /// Column name to base type, without length or precision modifiers
    pub column_types: HashMap<String, String>,
    /// Whether the id column is `GENERATED ALWAYS AS IDENTITY`
    pub id_always_generated: bool,
    pub primary_key: Option<String>,
}

impl TableInfo {
    fn column_type(&self, table: &str, column: &str) -> StoreResult<&str> {
        self.column_types
            .get(column)
            .map(String::as_str)
            .ok_or_else(|| StoreError::Schema(format!("column '{}' does not exist in {}", column, table)))
    }

    fn is_json_column(&self, column: &str) -> bool {
        matches!(
            self.column_types.get(column).map(String::as_str),
            Some("json" | "jsonb")
        )
    }
}

/// Columns to select for a source read
///
/// NUMERIC is read as text so the value keeps the scale Postgres prints.
pub(crate) fn select_list(info: &TableInfo) -> String {
    info.columns
        .iter()
        .map(|column| {
            let quoted = quote_ident(column);
            match info.column_types.get(column).map(String::as_str) {
                Some("numeric") => format!("{quoted}::text AS {quoted}"),
                _ => quoted,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shape the value of one destination column
///
/// A JSON value bound for a json/jsonb column is sent as its JSON text, so
/// strings, numbers and booleans survive the cast as JSON.
pub(crate) fn shape_for_column(
    info: &TableInfo,
    column: &str,
    value: Option<&FieldValue>,
) -> ShapedValue {
    match value {
        Some(FieldValue::Json(json)) if !json.is_null() && info.is_json_column(column) => {
            ShapedValue::Text(json.to_string())
        }
        _ => shape_optional(value),
    }
}

/// `CAST($n AS type)` for bound values, `NULL` for nulls; numbering starts at `first`
///
/// The cast names the base type only. Length and precision are left to the
/// assignment, which rejects values that do not fit instead of truncating.
fn value_expressions(
    info: &TableInfo,
    table: &str,
    columns: &[&String],
    values: &[&ShapedValue],
    first: usize,
) -> StoreResult<(Vec<String>, usize)> {
    let mut next = first;
    let mut expressions = Vec::with_capacity(columns.len());

    for (column, value) in columns.iter().zip(values) {
        let sql_type = info.column_type(table, column)?;
        if value.is_null() {
            expressions.push("NULL".to_string());
        } else {
            expressions.push(format!("CAST(${} AS {})", next, sql_type));
            next += 1;
        }
    }

    Ok((expressions, next))
}

pub(crate) fn insert_statement(
    info: &TableInfo,
    table: &str,
    columns: &[String],
    values: &[ShapedValue],
) -> StoreResult<String> {
    let column_refs: Vec<&String> = columns.iter().collect();
    let value_refs: Vec<&ShapedValue> = values.iter().collect();
    let (expressions, _) = value_expressions(info, table, &column_refs, &value_refs, 1)?;

    let overriding = if info.id_always_generated {
        " OVERRIDING SYSTEM VALUE"
    } else {
        ""
    };

    Ok(format!(
        "INSERT INTO {} ({}){} VALUES ({})",
        quote_ident(table),
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        overriding,
        expressions.join(", ")
    ))
}

/// Update of every non-key column by id; `None` when there is nothing to set
///
/// The id is bound after the non-null column values.
pub(crate) fn update_statement(
    info: &TableInfo,
    table: &str,
    columns: &[String],
    values: &[ShapedValue],
) -> StoreResult<Option<String>> {
    let (set_columns, set_values): (Vec<&String>, Vec<&ShapedValue>) = columns
        .iter()
        .zip(values)
        .filter(|(column, _)| column.as_str() != ID_COLUMN)
        .unzip();

    if set_columns.is_empty() {
        return Ok(None);
    }

    let (expressions, id_param) = value_expressions(info, table, &set_columns, &set_values, 1)?;
    let assignments = set_columns
        .iter()
        .zip(expressions)
        .map(|(column, expression)| format!("{} = {}", quote_ident(column), expression))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(Some(format!(
        "UPDATE {} SET {} WHERE {} = ${}",
        quote_ident(table),
        assignments,
        quote_ident(ID_COLUMN),
        id_param
    )))
}

fn bind_shaped<'q>(query: PgQuery<'q>, value: &'q ShapedValue) -> PgQuery<'q> {
    match value {
        ShapedValue::Null => query,
        ShapedValue::Bool(v) => query.bind(*v),
        ShapedValue::Int(v) => query.bind(*v),
        ShapedValue::Float(v) => query.bind(*v),
        ShapedValue::Text(v) => query.bind(v.as_str()),
    }
}

fn decode_column(row: &PgRow, column: &PgColumn) -> StoreResult<FieldValue> {
    let index = column.ordinal();
    let type_name = column.type_info().name();

    let value: FieldValue = match type_name {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.into(),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(i64::from).into(),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(i64::from).into(),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.into(),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(f64::from).into(),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.into(),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|v| v.to_string())
            .into(),
        "TIMESTAMP" => row.try_get::<Option<NaiveDateTime>, _>(index)?.into(),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| v.naive_utc())
            .into(),
        "DATE" => row.try_get::<Option<NaiveDate>, _>(index)?.into(),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)?
            .map(|v| v.to_string())
            .into(),
        "JSON" | "JSONB" => row.try_get::<Option<serde_json::Value>, _>(index)?.into(),
        _ => row
            .try_get::<Option<String>, _>(index)
            .map_err(|e| StoreError::decode(format!("column {} ({})", column.name(), type_name), e))?
            .into(),
    };

    Ok(value)
}

fn decode_row(row: &PgRow) -> StoreResult<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        out.insert(column.name(), decode_column(row, column)?);
    }
    Ok(out)
}

/// Source and destination table access over a shared pool
#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
}

impl PgTableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn describe(&self, table: &str) -> StoreResult<TableInfo> {
        let quoted = quote_ident(table);

        // A typmod of -1 spells the unmodified type: `character varying`,
        // `numeric`, `bpchar` (plain `character` would mean char(1))
        let columns: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT a.attname::text, format_type(a.atttypid, -1), a.attidentity::text \
             FROM pg_attribute a \
             WHERE a.attrelid = $1::regclass AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
        )
        .bind(&quoted)
        .fetch_all(&self.pool)
        .await?;

        if columns.is_empty() {
            return Err(StoreError::Schema(format!("table {} has no columns", table)));
        }

        let primary_key: Option<String> = sqlx::query_scalar(
            "SELECT conname::text FROM pg_constraint WHERE conrelid = $1::regclass AND contype = 'p'",
        )
        .bind(&quoted)
        .fetch_optional(&self.pool)
        .await?;

        let id_always_generated = columns
            .iter()
            .any(|(name, _, identity)| name == ID_COLUMN && identity == "a");

        Ok(TableInfo {
            columns: columns.iter().map(|(name, _, _)| name.clone()).collect(),
            column_types: columns
                .into_iter()
                .map(|(name, sql_type, _)| (name, sql_type))
                .collect(),
            id_always_generated,
            primary_key,
        })
    }
}

#[async_trait]
impl SourceReader for PgTableStore {
    async fn source_ids(&self, table: &str) -> StoreResult<Vec<i64>> {
        let query = format!(
            "SELECT {id}::bigint FROM {table} ORDER BY {id} ASC",
            id = quote_ident(ID_COLUMN),
            table = quote_ident(table)
        );
        debug!(target: SQL_TARGET, table, "[SELECT] {}", query);

        let ids: Vec<i64> = sqlx::query_scalar(&query).fetch_all(&self.pool).await?;
        Ok(ids)
    }

    async fn fetch_range(
        &self,
        table: &str,
        start_id: i64,
        last_id: i64,
        limit: u32,
    ) -> StoreResult<Vec<Row>> {
        let info = self.describe(table).await?;
        let query = format!(
            "SELECT {columns} FROM {table} WHERE {id} >= $1 AND {id} <= $2 ORDER BY {id} ASC LIMIT $3",
            columns = select_list(&info),
            id = quote_ident(ID_COLUMN),
            table = quote_ident(table)
        );
        debug!(target: SQL_TARGET, table, start_id, last_id, limit, "[SELECT] {}", query);

        let rows = sqlx::query(&query)
            .bind(start_id)
            .bind(last_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl DestinationWriter for PgTableStore {
    async fn load_batch(
        &self,
        table: &str,
        columns: &[String],
        rows: &[Row],
    ) -> StoreResult<LoadReport> {
        let info = self.describe(table).await?;

        let mut report = LoadReport::default();
        // Dropping the transaction on an early return rolls the whole batch back
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let id = row
                .id()
                .ok_or_else(|| StoreError::decode("destination row", "row has no integer id"))?;
            let values: Vec<ShapedValue> = columns
                .iter()
                .map(|column| shape_for_column(&info, column, row.get(column)))
                .collect();

            let insert_sql = insert_statement(&info, table, columns, &values)?;
            debug!(target: SQL_TARGET, table, id, params = ?values, "[INSERT] {}", insert_sql);

            let mut insert = sqlx::query(&insert_sql);
            for value in &values {
                insert = bind_shaped(insert, value);
            }

            let mut savepoint = tx.begin().await?;
            match insert.execute(&mut *savepoint).await {
                Ok(_) => {
                    savepoint.commit().await?;
                    report.inserted += 1;
                }
                Err(err) => {
                    let err = StoreError::from(err);
                    if !err.is_primary_key_violation(info.primary_key.as_deref()) {
                        return Err(err);
                    }
                    savepoint.rollback().await?;
                    debug!(
                        target: SQL_TARGET,
                        table,
                        id,
                        "Record already exists, updating instead"
                    );

                    if let Some(update_sql) = update_statement(&info, table, columns, &values)? {
                        debug!(target: SQL_TARGET, table, id, "[UPDATE] {}", update_sql);

                        let mut update = sqlx::query(&update_sql);
                        for (column, value) in columns.iter().zip(&values) {
                            if column.as_str() != ID_COLUMN {
                                update = bind_shaped(update, value);
                            }
                        }
                        update.bind(id).execute(&mut *tx).await?;
                    }
                    report.updated += 1;
                }
            }
        }

        tx.commit().await?;

        debug!(
            table,
            inserted = report.inserted,
            updated = report.updated,
            "Batch committed"
        );
        Ok(report)
    }

    async fn clear_table(&self, table: &str) -> StoreResult<u64> {
        let query = format!("DELETE FROM {}", quote_ident(table));
        debug!(target: SQL_TARGET, table, "[DELETE] {}", query);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
