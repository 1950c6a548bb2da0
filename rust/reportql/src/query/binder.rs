//! Named parameter binding.
//!
//! Compilers write `:name` placeholders and register values under the same name. Rendering
//! rewrites placeholders to positional `$n` markers in order of first appearance and emits the
//! matching parameter list, so identical inputs always produce identical statements.

use crate::error::{Result, ServiceError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum BindParam {
    Text(String),
    TextArray(Vec<String>),
    Int(i64),
    IntArray(Vec<i64>),
    Bool(bool),
    Float(f64),
    Timestamptz(DateTime<Utc>),
    Uuid(Uuid),
    UuidArray(Vec<Uuid>),
}

/// A rendered statement plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<BindParam>,
    /// The statement's ordering restated over its output columns, for executors that wrap it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<String>,
}

impl CompiledQuery {
    pub fn ordered_by(mut self, order: impl Into<String>) -> Self {
        self.order = Some(order.into());
        self
    }
}

#[derive(Debug, Default)]
pub struct ParamBinder {
    values: HashMap<String, BindParam>,
}

impl ParamBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `value` under `name` and returns the placeholder to splice into SQL.
    pub fn bind(&mut self, name: impl Into<String>, value: BindParam) -> Result<String> {
        let name = name.into();
        if self.values.contains_key(&name) {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "parameter :{name} bound twice"
            )));
        }
        let placeholder = format!(":{name}");
        self.values.insert(name, value);
        Ok(placeholder)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn render(&self, sql: &str) -> Result<CompiledQuery> {
        let mut out = String::with_capacity(sql.len());
        let mut order: Vec<&str> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let bytes = sql.as_bytes();
        let mut i = 0;
        // Open quote character while inside a string literal or quoted identifier.
        let mut quote: Option<u8> = None;

        while i < bytes.len() {
            let ch = bytes[i];
            if let Some(open) = quote {
                if ch == open {
                    quote = None;
                }
                let len = utf8_len(ch);
                out.push_str(&sql[i..i + len]);
                i += len;
                continue;
            }

            match ch {
                b'\'' | b'"' => {
                    quote = Some(ch);
                    out.push(ch as char);
                    i += 1;
                }
                b':' if bytes.get(i + 1) == Some(&b':') => {
                    out.push_str("::");
                    i += 2;
                }
                b':' if bytes.get(i + 1).is_some_and(|b| is_name_start(*b)) => {
                    let start = i + 1;
                    let mut end = start;
                    while end < bytes.len() && is_name_char(bytes[end]) {
                        end += 1;
                    }
                    let name = &sql[start..end];
                    let (key, _) = self.values.get_key_value(name).ok_or_else(|| {
                        ServiceError::Internal(anyhow::anyhow!("parameter :{name} is not bound"))
                    })?;
                    let position = match positions.get(key.as_str()) {
                        Some(position) => *position,
                        None => {
                            order.push(key.as_str());
                            positions.insert(key.as_str(), order.len());
                            order.len()
                        }
                    };
                    out.push('$');
                    out.push_str(&position.to_string());
                    i = end;
                }
                _ => {
                    // Copy whole UTF-8 sequences so multi-byte characters survive.
                    let len = utf8_len(ch);
                    out.push_str(&sql[i..i + len]);
                    i += len;
                }
            }
        }

        let params = order
            .into_iter()
            .filter_map(|name| self.values.get(name).cloned())
            .collect();

        Ok(CompiledQuery {
            sql: out,
            params,
            order: None,
        })
    }
}

/// Parameter-name suffix for the profile at `index`: the first profile keeps bare names.
pub fn profile_suffix(index: usize) -> String {
    if index == 0 {
        String::new()
    } else {
        format!("_{index}")
    }
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn utf8_len(first: u8) -> usize {
    match first {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_positional_placeholders_in_first_use_order() {
        let mut binder = ParamBinder::new();
        let status = binder
            .bind("job_statuses", BindParam::TextArray(vec!["SUCCESS".into()]))
            .unwrap();
        let from = binder.bind("start_time_start", BindParam::Int(10)).unwrap();
        let unused = binder.bind("unused", BindParam::Bool(true)).unwrap();
        assert_eq!(unused, ":unused");

        let sql = format!(
            "SELECT 1 WHERE r.start_time >= to_timestamp({from}) AND r.status = ANY({status}) OR r.start_time::date = to_timestamp({from})::date"
        );
        let compiled = binder.render(&sql).unwrap();

        assert_eq!(
            compiled.sql,
            "SELECT 1 WHERE r.start_time >= to_timestamp($1) AND r.status = ANY($2) OR r.start_time::date = to_timestamp($1)::date"
        );
        assert_eq!(
            compiled.params,
            vec![
                BindParam::Int(10),
                BindParam::TextArray(vec!["SUCCESS".into()])
            ]
        );
    }

    #[test]
    fn leaves_quoted_literals_alone() {
        let binder = ParamBinder::new();
        let compiled = binder
            .render("SELECT date_trunc('day', r.start_time AT TIME ZONE 'UTC') WHERE x = ':nope'")
            .unwrap();
        assert!(compiled.params.is_empty());
        assert!(compiled.sql.ends_with("':nope'"));
    }

    #[test]
    fn unbound_placeholder_is_an_error() {
        let binder = ParamBinder::new();
        assert!(binder.render("SELECT :missing").is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut binder = ParamBinder::new();
        binder.bind("offset", BindParam::Int(0)).unwrap();
        assert!(binder.bind("offset", BindParam::Int(1)).is_err());
    }

    #[test]
    fn profile_suffixes() {
        assert_eq!(profile_suffix(0), "");
        assert_eq!(profile_suffix(2), "_2");
    }
}
