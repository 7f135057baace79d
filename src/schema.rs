//! Schema Extractor (C3): structural summaries of data files, without their payload.
//!
//! Dispatched by extension. Each extractor is bounded by size/depth and never
//! materializes an entire large payload: CSV is streamed row-by-row, SQLite
//! goes through catalog queries, JSON/YAML structure sampling stops at one
//! array element per level.

use crate::config::DeepCleanConfig;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use tree_sitter::{Node, Parser, Query, QueryCursor, StreamingIterator};

pub fn extract_schema(path: &Path, cfg: &DeepCleanConfig) -> Result<Value> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    let result = match ext.as_str() {
        "json" => extract_json_schema(path, cfg.max_schema_depth),
        "csv" => extract_csv_schema(path, cfg.csv_sample_rows),
        "sqlite" | "sqlite3" | "db" => extract_sqlite_schema(path),
        "yaml" | "yml" => extract_yaml_schema(path, cfg.max_schema_depth),
        "py" => extract_python_variables_schema(path),
        _ => return Ok(Value::Null),
    };

    Ok(result.unwrap_or_else(|e| json!({ "error": e.to_string() })))
}

fn infer_json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursive structural extraction with a depth cap; arrays are shaped from
/// their first element only.
fn extract_structure(value: &Value, depth: usize, max_depth: usize) -> Value {
    if depth >= max_depth {
        return json!({ "type": infer_json_type(value), "truncated": true });
    }

    match value {
        Value::Object(map) => {
            let keys: serde_json::Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), extract_structure(v, depth + 1, max_depth)))
                .collect();
            json!({ "type": "object", "keys": keys })
        }
        Value::Array(items) => {
            if items.is_empty() {
                json!({ "type": "array", "items": "empty" })
            } else {
                json!({
                    "type": "array",
                    "length": items.len(),
                    "items": extract_structure(&items[0], depth + 1, max_depth),
                })
            }
        }
        other => json!({ "type": infer_json_type(other) }),
    }
}

fn extract_json_schema(path: &Path, max_depth: usize) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&text)?;
    Ok(extract_structure(&value, 0, max_depth))
}

fn extract_yaml_schema(path: &Path, max_depth: usize) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    let value: Value = serde_yaml::from_str(&text)?;
    Ok(extract_structure(&value, 0, max_depth))
}

/// Tries integer, then float, then falls back to string; an empty cell never
/// changes the running inference for a column.
fn infer_csv_type(values: &[String]) -> &'static str {
    for v in values {
        if v.is_empty() {
            continue;
        }
        if v.parse::<i64>().is_ok() {
            return "int";
        }
        if v.parse::<f64>().is_ok() {
            return "float";
        }
        return "str";
    }
    "str"
}

fn sniff_delimiter(sample: &str) -> u8 {
    const CANDIDATES: &[u8] = b",;\t|";
    CANDIDATES
        .iter()
        .copied()
        .max_by_key(|&d| sample.matches(d as char).count())
        .unwrap_or(b',')
}

fn extract_csv_schema(path: &Path, sample_rows: usize) -> Result<Value> {
    let raw = std::fs::read(path)?;
    let sniff_len = raw.len().min(1024);
    let delimiter = sniff_delimiter(&String::from_utf8_lossy(&raw[..sniff_len]));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .from_path(path)
        .with_context(|| format!("failed to open csv at {}", path.display()))?;

    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.to_string())
        .collect();

    let mut samples: Vec<Vec<String>> = vec![Vec::new(); columns.len()];
    let mut sample_records: Vec<std::collections::BTreeMap<String, String>> = Vec::new();
    let mut row_count: u64 = 0;

    for record in reader.records() {
        let record = record?;
        if row_count < sample_rows as u64 {
            let mut row = std::collections::BTreeMap::new();
            for (i, field) in record.iter().enumerate() {
                if let Some(col) = columns.get(i) {
                    row.insert(col.clone(), field.to_string());
                }
                if let Some(bucket) = samples.get_mut(i) {
                    bucket.push(field.to_string());
                }
            }
            sample_records.push(row);
        }
        row_count += 1;
    }

    let types: serde_json::Map<String, Value> = columns
        .iter()
        .enumerate()
        .map(|(i, col)| {
            let values = samples.get(i).map(|v| v.as_slice()).unwrap_or(&[]);
            (col.clone(), Value::String(infer_csv_type(values).to_string()))
        })
        .collect();

    Ok(json!({
        "columns": columns,
        "types": types,
        "row_count": row_count,
        "sample": sample_records,
    }))
}

fn extract_sqlite_schema(path: &Path) -> Result<Value> {
    let conn = rusqlite::Connection::open(path)
        .with_context(|| format!("failed to open sqlite db at {}", path.display()))?;

    let mut table_names = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table'")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            table_names.push(name);
        }
    }

    let mut tables = serde_json::Map::new();
    for table in table_names {
        let mut columns = Vec::new();
        {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let name: String = row.get(1)?;
                let col_type: String = row.get(2)?;
                let notnull: i64 = row.get(3)?;
                let pk: i64 = row.get(5)?;
                columns.push(json!({
                    "name": name,
                    "type": col_type,
                    "nullable": notnull == 0,
                    "pk": pk != 0,
                }));
            }
        }
        let row_count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| r.get(0))?;
        tables.insert(table, json!({ "columns": columns, "row_count": row_count }));
    }

    Ok(json!({ "tables": tables }))
}

/// Walks top-level `NAME = {...}` / `NAME = [...]` assignments via tree-sitter
/// instead of a Python AST module (Rust has none); a small digest, not a value dump.
fn extract_python_variables_schema(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)?;
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::language())
        .context("failed to load python grammar")?;
    let Some(tree) = parser.parse(&text, None) else {
        anyhow::bail!("failed to parse {}", path.display());
    };

    let query = Query::new(
        &tree_sitter_python::language(),
        r#"
        (expression_statement
          (assignment
            left: (identifier) @name
            right: [(dictionary) (list)] @value))
        "#,
    )
    .context("failed to compile python variable query")?;

    let mut cursor = QueryCursor::new();
    let source = text.as_bytes();
    let mut variables = serde_json::Map::new();

    let mut matches = cursor.matches(&query, tree.root_node(), source);
    while let Some(m) = matches.next() {
        let mut name: Option<Node> = None;
        let mut value: Option<Node> = None;
        for cap in m.captures {
            match query.capture_names()[cap.index as usize] {
                "name" => name = Some(cap.node),
                "value" => value = Some(cap.node),
                _ => {}
            }
        }
        let (Some(name), Some(value)) = (name, value) else {
            continue;
        };
        let var_name = node_text(source, name).to_string();
        let value_text = node_text(source, value);
        let estimated_tokens = value_text.len() / 4;

        let entry = match value.kind() {
            "dictionary" => {
                let keys = dict_keys(&value, source);
                json!({ "type": "dict", "keys": keys, "estimated_tokens": estimated_tokens })
            }
            "list" => {
                let length = value
                    .named_children(&mut value.walk())
                    .count();
                json!({ "type": "list", "length": length, "estimated_tokens": estimated_tokens })
            }
            _ => continue,
        };
        variables.insert(var_name, entry);
    }

    Ok(json!({ "variables": variables }))
}

fn dict_keys(dict_node: &Node, source: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    let mut cursor = dict_node.walk();
    for child in dict_node.named_children(&mut cursor) {
        if child.kind() == "pair" {
            if let Some(key) = child.child_by_field_name("key") {
                out.push(strip_quotes(node_text(source, key)));
            }
        }
    }
    out
}

fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

fn strip_quotes(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        if (bytes[0] == b'\'' && bytes[t.len() - 1] == b'\'')
            || (bytes[0] == b'"' && bytes[t.len() - 1] == b'"')
        {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

/// Markdown rendering of a schema for the trace-map emitter (C6). Dispatches on
/// the shape rather than a stored `type` tag, since the manifest only stores
/// the schema `Value` itself (the category on `MovedFile` carries the tag).
pub fn schema_to_markdown(category: &str, schema: &Value) -> String {
    if let Some(err) = schema.get("error").and_then(|e| e.as_str()) {
        return format!("**Error:** {err}\n");
    }

    match category {
        "Data" if schema.get("columns").is_some() => render_csv_markdown(schema),
        "Data" => render_json_like_markdown(schema),
        "Database" => render_sqlite_markdown(schema),
        "Code" => render_python_variables_markdown(schema),
        _ => "*(no schema)*\n".to_string(),
    }
}

fn render_json_like_markdown(schema: &Value) -> String {
    let mut out = String::from("**Structure:**\n```\n");
    out.push_str(&format_json_schema(schema, 0));
    out.push_str("\n```\n");
    out
}

fn format_json_schema(node: &Value, indent: usize) -> String {
    let prefix = "  ".repeat(indent);
    match node.get("type").and_then(|t| t.as_str()) {
        Some("object") => {
            let mut lines = vec!["{".to_string()];
            if let Some(keys) = node.get("keys").and_then(|k| k.as_object()) {
                for (key, value) in keys {
                    let ty = value.get("type").and_then(|t| t.as_str()).unwrap_or("unknown");
                    let rendered = match ty {
                        "array" => {
                            let items_ty = value
                                .get("items")
                                .and_then(|i| i.get("type"))
                                .and_then(|t| t.as_str())
                                .unwrap_or("unknown");
                            if items_ty == "object" {
                                "Array<{...}>".to_string()
                            } else {
                                format!("Array<{items_ty}>")
                            }
                        }
                        "object" => "{...}".to_string(),
                        other => other.to_string(),
                    };
                    lines.push(format!("{prefix}  {key}: {rendered}"));
                }
            }
            lines.push(format!("{prefix}}}"));
            lines.join("\n")
        }
        Some("array") => {
            let items_ty = node
                .get("items")
                .and_then(|i| i.get("type"))
                .and_then(|t| t.as_str())
                .unwrap_or("unknown");
            if items_ty == "object" {
                "Array<{...}>".to_string()
            } else {
                format!("Array<{items_ty}>")
            }
        }
        other => other.unwrap_or("unknown").to_string(),
    }
}

fn render_csv_markdown(schema: &Value) -> String {
    let columns = schema.get("columns").and_then(|c| c.as_array()).cloned().unwrap_or_default();
    let types = schema.get("types").cloned().unwrap_or_default();
    let row_count = schema.get("row_count").and_then(|r| r.as_u64()).unwrap_or(0);

    let mut out = format!(
        "**Columns:** {}\n**Rows:** {row_count}\n\n| Column | Type |\n|--------|------|\n",
        columns.len()
    );
    for col in &columns {
        let col = col.as_str().unwrap_or_default();
        let ty = types.get(col).and_then(|t| t.as_str()).unwrap_or("unknown");
        out.push_str(&format!("| `{col}` | `{ty}` |\n"));
    }
    out
}

fn render_sqlite_markdown(schema: &Value) -> String {
    let tables = schema.get("tables").and_then(|t| t.as_object()).cloned().unwrap_or_default();
    let mut out = format!("**Tables:** {}\n\n", tables.len());
    for (name, info) in &tables {
        let row_count = info.get("row_count").and_then(|r| r.as_i64()).unwrap_or(0);
        out.push_str(&format!(
            "### {name}\n**Rows:** {row_count}\n\n| Column | Type | Nullable | PK |\n|--------|------|----------|----|\n"
        ));
        if let Some(cols) = info.get("columns").and_then(|c| c.as_array()) {
            for col in cols {
                let n = col.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                let ty = col.get("type").and_then(|v| v.as_str()).unwrap_or_default();
                let nullable = col.get("nullable").and_then(|v| v.as_bool()).unwrap_or(false);
                let pk = col.get("pk").and_then(|v| v.as_bool()).unwrap_or(false);
                out.push_str(&format!(
                    "| `{n}` | `{ty}` | {} | {} |\n",
                    if nullable { "Yes" } else { "No" },
                    if pk { "Yes" } else { "No" }
                ));
            }
        }
        out.push('\n');
    }
    out
}

fn render_python_variables_markdown(schema: &Value) -> String {
    let variables = schema.get("variables").and_then(|v| v.as_object()).cloned().unwrap_or_default();
    let mut out = format!("**Variables:** {}\n\n", variables.len());
    for (name, info) in &variables {
        let ty = info.get("type").and_then(|v| v.as_str()).unwrap_or("unknown");
        let tokens = info.get("estimated_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        if ty == "dict" {
            let keys: Vec<String> = info
                .get("keys")
                .and_then(|k| k.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            let shown: Vec<&str> = keys.iter().take(10).map(String::as_str).collect();
            out.push_str(&format!("- `{name}`: dict with keys: {}\n", shown.join(", ")));
            if keys.len() > 10 {
                out.push_str(&format!("  ... and {} more keys\n", keys.len() - 10));
            }
        } else {
            let length = info.get("length").and_then(|v| v.as_u64()).unwrap_or(0);
            out.push_str(&format!("- `{name}`: list with {length} items\n"));
        }
        if tokens > 0 {
            out.push_str(&format!("  Estimated tokens: {tokens}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn json_schema_samples_first_array_element() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.json");
        std::fs::write(&path, r#"{"users":[{"name":"a","age":1}],"debug":true}"#).unwrap();
        let schema = extract_json_schema(&path, 3).unwrap();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["keys"]["debug"]["type"], "boolean");
        assert_eq!(schema["keys"]["users"]["type"], "array");
        assert_eq!(schema["keys"]["users"]["items"]["keys"]["name"]["type"], "string");
    }

    #[test]
    fn csv_schema_infers_types_and_counts_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, "id,name,price\n1,apple,1.5\n2,pear,2.0\n").unwrap();
        let schema = extract_csv_schema(&path, 5).unwrap();
        assert_eq!(schema["row_count"], 2);
        assert_eq!(schema["types"]["id"], "int");
        assert_eq!(schema["types"]["price"], "float");
        assert_eq!(schema["types"]["name"], "str");
    }

    #[test]
    fn empty_cell_does_not_change_inference() {
        let values = vec!["".to_string(), "42".to_string()];
        assert_eq!(infer_csv_type(&values), "int");
    }

    #[test]
    fn python_variables_schema_finds_top_level_dict() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.py");
        std::fs::write(&path, "DATA = {\"a\": 1, \"b\": 2}\n").unwrap();
        let schema = extract_python_variables_schema(&path).unwrap();
        assert_eq!(schema["variables"]["DATA"]["type"], "dict");
        let keys = schema["variables"]["DATA"]["keys"].as_array().unwrap();
        assert_eq!(keys.len(), 2);
    }
}
