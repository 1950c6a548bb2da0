//! The seam between compiled statements and whatever executes them.
//!
//! Rows come back as JSON objects keyed by output column so that every query shape (grouped
//! buckets, list pages, DORA metrics, hierarchy frontiers) can share one executor.

use crate::{error::Result, query::CompiledQuery};
use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

pub type Row = Map<String, Value>;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn fetch(&self, query: &CompiledQuery) -> Result<Vec<Row>>;
}

/// Reads a column as text; numbers are rendered with their JSON formatting.
pub fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}

pub fn int(row: &Row, column: &str) -> Option<i64> {
    match row.get(column)? {
        Value::Number(value) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|v| v.round() as i64)),
        Value::String(value) => value.parse().ok(),
        _ => None,
    }
}

pub fn float(row: &Row, column: &str) -> Option<f64> {
    match row.get(column)? {
        Value::Number(value) => value.as_f64(),
        Value::String(value) => value.parse().ok(),
        _ => None,
    }
}

pub fn uuid(row: &Row, column: &str) -> Option<Uuid> {
    row.get(column)?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn typed_readers_accept_postgres_json_shapes() {
        let row = row(json!({
            "key": 1704067200,
            "ct": "12",
            "md": 4.5,
            "id": "6f1c7b5e-2f0a-4d7e-9a51-3f4b5d7c9e01",
            "missing": null
        }));

        assert_eq!(text(&row, "key").as_deref(), Some("1704067200"));
        assert_eq!(int(&row, "ct"), Some(12));
        assert_eq!(float(&row, "md"), Some(4.5));
        assert!(uuid(&row, "id").is_some());
        assert_eq!(text(&row, "missing"), None);
        assert_eq!(int(&row, "absent"), None);
    }
}
