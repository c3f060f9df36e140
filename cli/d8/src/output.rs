//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tabled::{Table, Tabled};

const CLI_SCHEMA_VERSION: &str = "d8.cli.v1";

/// Output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print data in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table if data.is_empty() => println!("{}", "No items found.".dimmed()),
        OutputFormat::Table => println!("{}", Table::new(data)),
        OutputFormat::Json => print_json(data),
    }
}

/// Print a success message, or a JSON document in json mode.
pub fn print_result<T: Serialize>(message: &str, data: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => print_success(message),
        OutputFormat::Json => print_json(data),
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Versioned wrapper around every JSON document the CLI prints.
#[derive(Serialize)]
struct Envelope<'a, T: ?Sized> {
    #[serde(rename = "schemaVersion")]
    schema_version: &'static str,
    data: &'a T,
}

fn print_json<T: Serialize + ?Sized>(data: &T) {
    match render_json(data) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("{} failed to encode output: {e}", "Error:".red().bold()),
    }
}

/// Render `data` inside an [`Envelope`] with object keys in sorted order, so
/// output is stable for scripts that diff it.
fn render_json<T: Serialize + ?Sized>(data: &T) -> serde_json::Result<String> {
    let mut value = serde_json::to_value(Envelope {
        schema_version: CLI_SCHEMA_VERSION,
        data,
    })?;
    sort_keys(&mut value);
    serde_json::to_string_pretty(&value)
}

fn sort_keys(value: &mut Value) {
    match value {
        Value::Array(items) => items.iter_mut().for_each(sort_keys),
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (key, mut item) in entries {
                sort_keys(&mut item);
                map.insert(key, item);
            }
        }
        _ => {}
    }
}
