//! The pluggable transfer contract supplied by each module

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use super::row::{DestinationRow, SourceRow, ID_COLUMN};
use crate::queue::TransferPair;

/// One `source -> destination` column pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub source: String,
    pub destination: String,
}

impl ColumnMapping {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }

    /// Same column name on both sides
    pub fn same(column: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            source: column.clone(),
            destination: column,
        }
    }
}

/// Reshapes a batch of source rows into destination rows
///
/// May drop rows; the returned rows must carry an `id` and the mapped
/// destination columns.
#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, rows: Vec<SourceRow>) -> anyhow::Result<Vec<DestinationRow>>;
}

/// Copies every mapped column under its destination name
#[derive(Debug, Clone)]
pub struct ColumnRename {
    mappings: Vec<ColumnMapping>,
}

impl ColumnRename {
    pub fn new(mappings: Vec<ColumnMapping>) -> Self {
        Self { mappings }
    }
}

#[async_trait]
impl Transform for ColumnRename {
    async fn transform(&self, rows: Vec<SourceRow>) -> anyhow::Result<Vec<DestinationRow>> {
        Ok(rows
            .into_iter()
            .map(|row| {
                self.mappings
                    .iter()
                    .filter_map(|m| {
                        row.get(&m.source)
                            .map(|value| (m.destination.clone(), value.clone()))
                    })
                    .collect::<DestinationRow>()
            })
            .collect())
    }
}

type TransformFn =
    dyn Fn(Vec<SourceRow>) -> BoxFuture<'static, anyhow::Result<Vec<DestinationRow>>> + Send + Sync;

/// A transform backed by an async closure
pub struct FnTransform {
    f: Box<TransformFn>,
}

impl FnTransform {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<SourceRow>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<DestinationRow>>> + Send + 'static,
    {
        Self {
            f: Box::new(move |rows| Box::pin(f(rows))),
        }
    }
}

#[async_trait]
impl Transform for FnTransform {
    async fn transform(&self, rows: Vec<SourceRow>) -> anyhow::Result<Vec<DestinationRow>> {
        (self.f)(rows).await
    }
}

/// Everything the engine needs to move one source table into one destination table
///
/// Built once at startup and shared read-only.
#[derive(Clone)]
pub struct TransferSpec {
    pub source_table: String,
    pub destination_table: String,
    pub column_map: Vec<ColumnMapping>,
    pub transform: Arc<dyn Transform>,
}

impl TransferSpec {
    pub fn new(
        source_table: impl Into<String>,
        destination_table: impl Into<String>,
        column_map: Vec<ColumnMapping>,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            source_table: source_table.into(),
            destination_table: destination_table.into(),
            column_map,
            transform,
        }
    }

    /// A spec whose transform just renames mapped columns
    pub fn copy(
        source_table: impl Into<String>,
        destination_table: impl Into<String>,
        column_map: Vec<ColumnMapping>,
    ) -> Self {
        let transform = Arc::new(ColumnRename::new(column_map.clone()));
        Self::new(source_table, destination_table, column_map, transform)
    }

    pub fn pair(&self) -> TransferPair {
        TransferPair::new(&self.source_table, &self.destination_table)
    }

    /// Destination column names in mapping order
    pub fn destination_columns(&self) -> Vec<String> {
        self.column_map
            .iter()
            .map(|m| m.destination.clone())
            .collect()
    }

    /// Check the spec is loadable; returns the reason when it is not
    pub fn validate(&self) -> Result<(), String> {
        if self.source_table.trim().is_empty() {
            return Err("source table is empty".to_string());
        }
        if self.destination_table.trim().is_empty() {
            return Err("destination table is empty".to_string());
        }
        if self.column_map.is_empty() {
            return Err("column map is empty".to_string());
        }

        let mut seen = HashSet::new();
        for mapping in &self.column_map {
            if mapping.destination.trim().is_empty() {
                return Err(format!("column '{}' maps to an empty name", mapping.source));
            }
            if !seen.insert(mapping.destination.as_str()) {
                return Err(format!(
                    "destination column '{}' is mapped more than once",
                    mapping.destination
                ));
            }
        }

        if !seen.contains(ID_COLUMN) {
            return Err(format!("column map has no '{}' destination", ID_COLUMN));
        }

        Ok(())
    }
}

impl std::fmt::Debug for TransferSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSpec")
            .field("source_table", &self.source_table)
            .field("destination_table", &self.destination_table)
            .field("column_map", &self.column_map)
            .finish_non_exhaustive()
    }
}
