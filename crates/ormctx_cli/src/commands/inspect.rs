//! Inspect command implementation.

use ormctx_core::StreamSummary;
use serde::Serialize;
use std::path::Path;

/// Stream inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Path of the stream.
    pub path: String,
    /// Stream size in bytes.
    pub size_bytes: usize,
    /// Format version.
    pub version: i64,
    /// Default read-only setting of the passivated context.
    pub default_read_only: bool,
    /// Whether the context held modifiable entities.
    pub has_non_read_only_entities: bool,
    /// Object table counts.
    pub tables: Vec<CountInfo>,
    /// Section counts, in stream order.
    pub sections: Vec<CountInfo>,
}

/// Item count of one table or section.
#[derive(Debug, Serialize)]
pub struct CountInfo {
    /// Table or section name.
    pub name: String,
    /// Number of items.
    pub count: usize,
}

impl InspectResult {
    fn from_summary(path: &Path, summary: &StreamSummary) -> Self {
        let counts = |items: &[(&str, usize)]| {
            items
                .iter()
                .map(|(name, count)| CountInfo {
                    name: (*name).to_string(),
                    count: *count,
                })
                .collect()
        };
        Self {
            path: path.display().to_string(),
            size_bytes: summary.bytes,
            version: summary.version,
            default_read_only: summary.default_read_only,
            has_non_read_only_entities: summary.has_non_read_only_entities,
            tables: counts(&summary.tables),
            sections: counts(&summary.sections),
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("Stream not found: {}", path.display()).into());
    }

    let bytes = std::fs::read(path)?;
    let summary = StreamSummary::read(&bytes)?;
    let result = InspectResult::from_summary(path, &summary);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("=== Persistence Context Stream ===");
    println!("Path: {}", result.path);
    println!("Size: {}", format_size(result.size_bytes));
    println!("Format version: {}", result.version);
    println!("Default read-only: {}", result.default_read_only);
    println!("Modifiable entities: {}", result.has_non_read_only_entities);
    println!();

    println!("=== Tables ===");
    for table in &result.tables {
        println!("  {:<30} {:>8}", table.name, table.count);
    }
    println!();

    println!("=== Sections ===");
    for section in &result.sections {
        println!("  {:<30} {:>8}", section.name, section.count);
    }
}

fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_humanized() {
        assert_eq!(format_size(12), "12 bytes");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
    }
}
