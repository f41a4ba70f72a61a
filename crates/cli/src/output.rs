//! Output formatting for `qmpctl`
//!
//! Unlike a typed daemon client, every response here is a bare
//! `serde_json::Value` fresh off the wire — there is no fixed schema to
//! hang a `TableDisplay` impl on, so the table renderer walks whatever
//! top-level object keys the response happens to have.

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde_json::Value;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Print one QMP/QGA response value.
pub fn print_value(value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Table => print_table(value),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(value).unwrap_or_default());
        }
        OutputFormat::Plain => print_plain(value, ""),
    }
}

fn print_table(value: &Value) {
    let Value::Object(map) = value else {
        println!("{value}");
        return;
    };

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Field", "Value"]);

    for (key, val) in map {
        table.add_row(vec![key.clone(), compact(val)]);
    }

    println!("{table}");
}

fn print_plain(value: &Value, prefix: &str) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                print_plain(val, &path);
            }
        }
        other => println!("{prefix}: {}", compact(other)),
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("error: {message}");
}
