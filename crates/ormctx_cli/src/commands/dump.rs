//! Dump command implementation.

use ormctx_codec::{StreamReader, Value};
use ormctx_core::{SECTION_NAMES, TABLE_NAMES};
use serde::Serialize;
use std::path::Path;

/// Items of one table or section.
#[derive(Debug, Serialize)]
pub struct SectionDump {
    /// Table or section name.
    pub name: String,
    /// Total number of items in the stream.
    pub count: usize,
    /// Dumped items, at most the requested limit.
    pub items: Vec<serde_json::Value>,
}

/// Runs the dump command.
pub fn run(
    path: &Path,
    section: Option<&str>,
    limit: Option<usize>,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    let dumps = read_sections(&bytes, limit.unwrap_or(usize::MAX))?;
    let dumps: Vec<_> = dumps
        .into_iter()
        .filter(|d| section.map_or(true, |name| d.name == name))
        .collect();
    if let Some(name) = section {
        if dumps.is_empty() {
            return Err(format!("No table or section named {name}").into());
        }
    }

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&dumps)?);
        }
        _ => {
            print_text_output(&dumps);
        }
    }

    Ok(())
}

/// Reads every table and section of a stream, keeping `limit` items of each.
pub fn read_sections(
    bytes: &[u8],
    limit: usize,
) -> Result<Vec<SectionDump>, Box<dyn std::error::Error>> {
    let mut input = StreamReader::new(bytes);
    let magic = input.read_text()?;
    let version = input.read()?;
    let default_read_only = input.read_bool()?;
    let has_non_read_only_entities = input.read_bool()?;
    tracing::debug!(%magic, %version, "dumping stream");

    let mut dumps = vec![SectionDump {
        name: "header".to_string(),
        count: 4,
        items: vec![
            serde_json::Value::String(magic),
            to_json(&version),
            serde_json::Value::Bool(default_read_only),
            serde_json::Value::Bool(has_non_read_only_entities),
        ],
    }];
    for name in TABLE_NAMES.iter().chain(SECTION_NAMES.iter()) {
        let count = input.read_count()?;
        let mut items = Vec::with_capacity(count.min(limit));
        for i in 0..count {
            let item = input.read()?;
            if i < limit {
                items.push(to_json(&item));
            }
        }
        dumps.push(SectionDump {
            name: (*name).to_string(),
            count,
            items,
        });
    }
    if !input.is_finished() {
        return Err(format!("trailing data at offset {}", input.position()).into());
    }
    Ok(dumps)
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::from(*n),
        Value::Bytes(_) => serde_json::Value::String(value.to_string()),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(to_json).collect()),
        Value::Map(pairs) => serde_json::Value::Object(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), to_json(v)))
                .collect(),
        ),
    }
}

fn print_text_output(dumps: &[SectionDump]) {
    for dump in dumps {
        println!("=== {} ({} items) ===", dump.name, dump.count);
        for (i, item) in dump.items.iter().enumerate() {
            println!("  [{i}] {item}");
        }
        if dump.items.len() < dump.count {
            println!("  ... {} more", dump.count - dump.items.len());
        }
    }
}
