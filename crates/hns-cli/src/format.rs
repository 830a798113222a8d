//! Table model and kubectl-style column rendering.

use serde::Deserialize;
use serde_json::Value;

/// A `meta.k8s.io/v1` Table response.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Table {
    pub metadata: TableMetadata,
    pub column_definitions: Vec<ColumnDefinition>,
    pub rows: Vec<TableRow>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableMetadata {
    pub resource_version: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ColumnDefinition {
    pub name: String,
    /// Columns with a non-zero priority are wide-output only and skipped.
    pub priority: i32,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableRow {
    pub cells: Vec<Value>,
    pub object: Value,
}

impl TableRow {
    /// Namespace of the embedded object, empty when absent.
    pub fn namespace(&self) -> &str {
        self.object
            .get("metadata")
            .and_then(|meta| meta.get("namespace"))
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Render the table with a NAMESPACE column first, kubectl style.
pub fn render_table(table: &Table, with_headers: bool) -> String {
    let mut headers = vec!["NAMESPACE".to_string()];
    let mut visible = Vec::new();
    for (index, column) in table.column_definitions.iter().enumerate() {
        if column.priority == 0 {
            headers.push(column.name.to_uppercase());
            visible.push(index);
        }
    }

    let rows: Vec<Vec<String>> = table
        .rows
        .iter()
        .map(|row| {
            let mut line = vec![row.namespace().to_string()];
            for &index in &visible {
                line.push(cell_text(row.cells.get(index)));
            }
            line
        })
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(String::len).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let mut out = String::new();
    if with_headers {
        push_line(&mut out, &headers, &widths);
    }
    for row in &rows {
        push_line(&mut out, row, &widths);
    }
    out
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize]) {
    let line: Vec<String> = cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let width = widths.get(i).copied().unwrap_or(0);
            format!("{cell:<width$}")
        })
        .collect();
    out.push_str(line.join("  ").trim_end());
    out.push('\n');
}

fn cell_text(cell: Option<&Value>) -> String {
    match cell {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
