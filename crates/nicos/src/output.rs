//! Output formatting: table, JSON, YAML, plain.
//!
//! Renders data in the format selected by `--output`. Table uses `tabled`,
//! structured formats use serde, plain emits one line per item.

use std::io::{self, IsTerminal, Write};

use nicos_core::Status;
use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use crate::cli::{ColorMode, OutputFormat};

// ── Color helpers ────────────────────────────────────────────────────

/// Determine whether color output should be enabled.
pub fn should_color(mode: &ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

/// A status name, colored by severity.
pub fn status_label(status: Status, color: bool) -> String {
    let text = status.to_string();
    if !color {
        return text;
    }
    match status {
        Status::Ok => text.green().to_string(),
        Status::Busy => text.yellow().to_string(),
        Status::Error => text.red().bold().to_string(),
        _ => text.magenta().to_string(),
    }
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a list of serializable items in the chosen format.
///
/// `to_row` builds the table row, `line` the plain-text line.
pub fn render_list<T, R>(
    format: &OutputFormat,
    data: &[T],
    to_row: impl Fn(&T) -> R,
    line: impl Fn(&T) -> String,
) -> String
where
    T: serde::Serialize,
    R: Tabled,
{
    match format {
        OutputFormat::Table => {
            let rows: Vec<R> = data.iter().map(to_row).collect();
            render_table(&rows)
        }
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
        OutputFormat::Yaml => render_yaml(data),
        OutputFormat::Plain => data.iter().map(&line).collect::<Vec<_>>().join("\n"),
    }
}

/// Render a single serializable item in the chosen format.
pub fn render_single<T>(
    format: &OutputFormat,
    data: &T,
    detail: impl Fn(&T) -> String,
    line: impl Fn(&T) -> String,
) -> String
where
    T: serde::Serialize,
{
    match format {
        OutputFormat::Table => detail(data),
        OutputFormat::Json => render_json(data, false),
        OutputFormat::JsonCompact => render_json(data, true),
        OutputFormat::Yaml => render_yaml(data),
        OutputFormat::Plain => line(data),
    }
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Format-specific renderers ────────────────────────────────────────

fn render_table<R: Tabled>(rows: &[R]) -> String {
    Table::new(rows).with(Style::rounded()).to_string()
}

pub(crate) fn render_json<T: serde::Serialize + ?Sized>(data: &T, compact: bool) -> String {
    let rendered = if compact {
        serde_json::to_string(data)
    } else {
        serde_json::to_string_pretty(data)
    };
    rendered.unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

fn render_yaml<T: serde::Serialize + ?Sized>(data: &T) -> String {
    serde_yaml::to_string(data).unwrap_or_else(|e| format!("error: serialization failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize)]
    struct Item {
        key: &'static str,
    }

    #[derive(Tabled)]
    struct Row {
        #[tabled(rename = "Key")]
        key: &'static str,
    }

    #[test]
    fn plain_lists_one_line_per_item() {
        let data = [Item { key: "a" }, Item { key: "b" }];
        let out = render_list(
            &OutputFormat::Plain,
            &data,
            |i| Row { key: i.key },
            |i| i.key.to_owned(),
        );
        assert_eq!(out, "a\nb");
    }

    #[test]
    fn json_and_table_render() {
        let data = [Item { key: "m1/value" }];
        let row = |i: &Item| Row { key: i.key };
        let json = render_list(&OutputFormat::JsonCompact, &data, row, |_| String::new());
        assert_eq!(json, r#"[{"key":"m1/value"}]"#);
        let table = render_list(&OutputFormat::Table, &data, row, |_| String::new());
        assert!(table.contains("Key") && table.contains("m1/value"));
    }

    #[test]
    fn status_labels_are_plain_without_color() {
        assert_eq!(status_label(Status::Busy, false), "busy");
        assert!(status_label(Status::Error, true).contains("error"));
    }
}
