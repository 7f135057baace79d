//! AST Path Patcher (C5): rewrites literal path arguments in Python source
//! files that match a moved file into calls against the indirection module,
//! and separately flags dynamic path constructions it cannot rewrite safely.

use crate::config::DeepCleanConfig;
use crate::paths::{Manifest, ProjectRoot};
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tree_sitter::{Node, Parser, Query, QueryCursor, StreamingIterator};

const SKIP_DIRS: &[&str] = &[
    "venv",
    ".venv",
    "env",
    "node_modules",
    "__pycache__",
    ".git",
    ".idea",
    ".vscode",
    "dist",
    "build",
];

/// Callables whose first positional string-literal argument is rewritten.
const ARG_REWRITE_FORMS: &[&str] = &[
    "open", "read_csv", "read_json", "read_excel", "read_parquet", "read_pickle", "connect",
];
/// Callables whose entire call expression is replaced.
const WHOLE_CALL_REWRITE_FORMS: &[&str] = &["Path"];

#[derive(Debug, Clone)]
pub struct PatchedFile {
    pub project_relative_path: String,
    pub substitutions: usize,
}

#[derive(Debug, Clone)]
pub struct DynamicPathWarning {
    pub project_relative_path: String,
    pub line: usize,
    pub kind: String,
    pub snippet: String,
}

#[derive(Debug, Default)]
pub struct PatchResult {
    pub patched: Vec<PatchedFile>,
    pub errors: Vec<(String, String)>,
    pub dynamic_warnings: Vec<DynamicPathWarning>,
}

fn normalize(p: &str) -> String {
    p.replace('\\', "/").trim_start_matches("./").to_string()
}

fn should_skip_dir(name: &str) -> bool {
    SKIP_DIRS.contains(&name) || (name.starts_with('.') && name != ".github")
}

fn is_excluded_file(path: &Path, cfg: &DeepCleanConfig) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name == "config_paths.py" {
        return true;
    }
    cfg.test_file_excludes
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .any(|p| p.matches(&name))
}

/// Walks `project`, patching every non-excluded `.py` file whose literals
/// reference a moved file, then separately scans for dynamic-path warnings.
pub fn patch_project(
    project: &ProjectRoot,
    manifest: &Manifest,
    cfg: &DeepCleanConfig,
) -> Result<PatchResult> {
    let moved: Vec<String> = manifest
        .files
        .iter()
        .map(|f| normalize(&f.project_relative_path))
        .collect();

    let mut py_files = Vec::new();
    collect_py_files(project.path(), project.path(), cfg, &mut py_files);

    let mut result = PatchResult::default();
    for abs_path in &py_files {
        let rel = abs_path
            .strip_prefix(project.path())
            .unwrap_or(abs_path)
            .to_string_lossy()
            .replace('\\', "/");
        let source = match fs::read_to_string(abs_path) {
            Ok(s) => s,
            Err(e) => {
                result.errors.push((rel, e.to_string()));
                continue;
            }
        };

        match patch_source(&source, &moved) {
            Ok(Some((patched, count))) => {
                let bak_path = abs_path.with_extension("py.bak");
                if let Err(e) = fs::write(&bak_path, &source) {
                    result.errors.push((rel.clone(), e.to_string()));
                    continue;
                }
                if let Err(e) = fs::write(abs_path, patched) {
                    result.errors.push((rel.clone(), e.to_string()));
                    continue;
                }
                result.patched.push(PatchedFile {
                    project_relative_path: rel,
                    substitutions: count,
                });
            }
            Ok(None) => {}
            Err(e) => result.errors.push((rel, e.to_string())),
        }
    }

    let prefixes: BTreeSet<String> = manifest
        .files
        .iter()
        .filter_map(|f| {
            Path::new(&f.project_relative_path)
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
        })
        .collect();
    if !prefixes.is_empty() {
        for abs_path in &py_files {
            let rel = abs_path
                .strip_prefix(project.path())
                .unwrap_or(abs_path)
                .to_string_lossy()
                .replace('\\', "/");
            if let Ok(source) = fs::read_to_string(abs_path) {
                result
                    .dynamic_warnings
                    .extend(scan_dynamic_paths(&source, &rel, &prefixes));
            }
        }
    }

    Ok(result)
}

fn collect_py_files(dir: &Path, project_root: &Path, cfg: &DeepCleanConfig, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if file_type.is_dir() {
            if should_skip_dir(&name) {
                continue;
            }
            collect_py_files(&path, project_root, cfg, out);
            continue;
        }
        if path.extension().map(|e| e == "py").unwrap_or(false) && !is_excluded_file(&path, cfg) {
            out.push(path);
        }
    }
}

/// Patches `source` against the moved-file set. Returns `Ok(None)` when no
/// literal in the file matched anything (source untouched), `Ok(Some((text,
/// count)))` on a successful, re-parse-validated patch, and propagates a
/// parse error only for the initial (pre-patch) parse of the source itself.
pub fn patch_source(source: &str, moved: &[String]) -> Result<Option<(String, usize)>> {
    let language = tree_sitter_python::language();
    let mut parser = Parser::new();
    parser
        .set_language(&language)
        .context("failed to set tree-sitter-python language")?;
    let tree = parser
        .parse(source, None)
        .context("tree-sitter failed to produce a parse tree")?;
    let root = tree.root_node();
    let bytes = source.as_bytes();

    let query_src = "(call) @call";
    let query = Query::new(&language, query_src).context("failed to compile call query")?;
    let mut cursor = QueryCursor::new();

    // (start_byte, end_byte, replacement)
    let mut edits: Vec<(usize, usize, String)> = Vec::new();

    let mut matches = cursor.matches(&query, root, bytes);
    while let Some(m) = matches.next() {
        for cap in m.captures {
            let call_node = cap.node;
            let Some(func_node) = call_node.child_by_field_name("function") else {
                continue;
            };
            let callee = callee_name(bytes, func_node);
            let whole_call = WHOLE_CALL_REWRITE_FORMS.contains(&callee.as_str());
            let arg_rewrite = ARG_REWRITE_FORMS.contains(&callee.as_str());
            if !whole_call && !arg_rewrite {
                continue;
            }
            let Some(args_node) = call_node.child_by_field_name("arguments") else {
                continue;
            };
            let Some(first_arg) = first_positional_string(args_node) else {
                continue;
            };
            let literal_text = node_text(bytes, first_arg);
            if literal_text.contains('{') {
                continue; // f-string / interpolation, not a plain literal
            }
            let literal = strip_quotes(literal_text);
            let Some(matched) = find_match(&literal, moved) else {
                continue;
            };

            let replacement = format!("get_path(\"{matched}\")");
            if whole_call {
                edits.push((call_node.start_byte(), call_node.end_byte(), replacement));
            } else {
                edits.push((first_arg.start_byte(), first_arg.end_byte(), replacement));
            }
        }
    }

    if edits.is_empty() {
        return Ok(None);
    }

    edits.sort_by(|a, b| b.0.cmp(&a.0));
    let mut patched = source.to_string();
    for (start, end, replacement) in &edits {
        patched.replace_range(*start..*end, replacement);
    }
    let count = edits.len();

    let patched = ensure_get_path_import(&patched);

    // Re-parse for validity; discard the patch entirely if it broke the source.
    let mut verify_parser = Parser::new();
    verify_parser
        .set_language(&language)
        .context("failed to set tree-sitter-python language")?;
    let reparsed = verify_parser
        .parse(&patched, None)
        .context("tree-sitter failed to re-parse patched source")?;
    if reparsed.root_node().has_error() {
        anyhow::bail!("patched source failed to re-parse cleanly; patch discarded");
    }

    Ok(Some((patched, count)))
}

fn callee_name(source: &[u8], func_node: Node) -> String {
    match func_node.kind() {
        "identifier" => node_text(source, func_node).to_string(),
        "attribute" => func_node
            .child_by_field_name("attribute")
            .map(|n| node_text(source, n).to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn first_positional_string(args_node: Node) -> Option<Node> {
    let mut cursor = args_node.walk();
    for child in args_node.named_children(&mut cursor) {
        if child.kind() == "string" {
            return Some(child);
        }
        return None; // first positional isn't a plain string literal
    }
    None
}

fn node_text<'a>(source: &'a [u8], node: Node) -> &'a str {
    std::str::from_utf8(&source[node.start_byte()..node.end_byte()]).unwrap_or("")
}

fn strip_quotes(s: &str) -> String {
    let t = s.trim();
    if t.len() >= 2 {
        let bytes = t.as_bytes();
        let (first, last) = (bytes[0], bytes[t.len() - 1]);
        if (first == b'\'' && last == b'\'') || (first == b'"' && last == b'"') {
            return t[1..t.len() - 1].to_string();
        }
    }
    t.to_string()
}

/// `normalize(L) == normalize(M)` or `normalize(L)` ends with `normalize(M)`.
fn find_match<'a>(literal: &str, moved: &'a [String]) -> Option<&'a String> {
    let l = normalize(literal);
    moved
        .iter()
        .find(|m| l == **m || l.ends_with(m.as_str()))
}

fn ensure_get_path_import(source: &str) -> String {
    if source.contains("from config_paths import") || source.contains("import config_paths") {
        return source.to_string();
    }

    let lines: Vec<&str> = source.lines().collect();
    let mut idx = 0;

    // Skip a leading module docstring.
    if idx < lines.len() {
        let trimmed = lines[idx].trim_start();
        if trimmed.starts_with("\"\"\"") || trimmed.starts_with("'''") {
            let quote = &trimmed[..3];
            let mut closed = trimmed[3..].contains(quote);
            idx += 1;
            while !closed && idx < lines.len() {
                closed = lines[idx].contains(quote);
                idx += 1;
            }
        }
    }

    // Skip blank lines and comments before the import block.
    while idx < lines.len() && (lines[idx].trim().is_empty() || lines[idx].trim_start().starts_with('#')) {
        idx += 1;
    }

    let mut insert_at = idx;
    while insert_at < lines.len() {
        let t = lines[insert_at].trim_start();
        if t.starts_with("import ") || t.starts_with("from ") {
            insert_at += 1;
        } else {
            break;
        }
    }

    let mut out = lines[..insert_at].join("\n");
    if insert_at > 0 {
        out.push('\n');
    }
    out.push_str("from config_paths import get_path\n");
    if insert_at < lines.len() {
        out.push_str(&lines[insert_at..].join("\n"));
        out.push('\n');
    }
    out
}

fn scan_dynamic_paths(
    source: &str,
    project_relative_path: &str,
    prefixes: &BTreeSet<String>,
) -> Vec<DynamicPathWarning> {
    let mut warnings = Vec::new();
    for prefix in prefixes {
        let p = regex::escape(prefix);
        let patterns: [(&str, String); 5] = [
            (
                "interp_string",
                format!(r#"f["'][^"']*{p}/[^"']*\{{[^}}]*\}}[^"']*["']"#),
            ),
            ("concat", format!(r#"["']{p}/["']\s*\+"#)),
            ("join_call", format!(r#"os\.path\.join\(\s*["']{p}["']"#)),
            ("path_concat", format!(r#"Path\(["']{p}["']\)\s*/"#)),
            (
                "format_call",
                format!(r#"["'][^"']*{p}/[^"']*["']\.format\("#),
            ),
        ];
        for (kind, pattern) in patterns {
            let Ok(re) = Regex::new(&pattern) else {
                continue;
            };
            for m in re.find_iter(source) {
                let line = source[..m.start()].matches('\n').count() + 1;
                warnings.push(DynamicPathWarning {
                    project_relative_path: project_relative_path.to_string(),
                    line,
                    kind: kind.to_string(),
                    snippet: m.as_str().to_string(),
                });
            }
        }
    }
    warnings
}

/// Walks for every `<file>.bak`, restores its sibling, deletes the backup.
pub fn revert(project: &ProjectRoot) -> Result<usize> {
    let mut restored = 0;
    revert_dir(project.path(), &mut restored)?;
    Ok(restored)
}

fn revert_dir(dir: &Path, restored: &mut usize) -> Result<()> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if should_skip_dir(&name) {
                continue;
            }
            revert_dir(&path, restored)?;
            continue;
        }
        if path.extension().map(|e| e == "bak").unwrap_or(false) {
            let original = path.with_extension("");
            fs::copy(&path, &original)
                .with_context(|| format!("failed to restore {}", original.display()))?;
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            *restored += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_open_call_with_matching_literal() {
        let source = "with open(\"data/products.json\") as f:\n    pass\n";
        let moved = vec!["data/products.json".to_string()];
        let (patched, count) = patch_source(source, &moved).unwrap().unwrap();
        assert_eq!(count, 1);
        assert!(patched.contains("open(get_path(\"data/products.json\"))"));
        assert!(patched.contains("from config_paths import get_path"));
    }

    #[test]
    fn rewrites_whole_path_constructor_call() {
        let source = "p = Path(\"data/products.json\")\n";
        let moved = vec!["data/products.json".to_string()];
        let (patched, _) = patch_source(source, &moved).unwrap().unwrap();
        assert!(patched.contains("p = get_path(\"data/products.json\")"));
    }

    #[test]
    fn leaves_non_matching_literals_untouched() {
        let source = "with open(\"other.json\") as f:\n    pass\n";
        let moved = vec!["data/products.json".to_string()];
        assert!(patch_source(source, &moved).unwrap().is_none());
    }

    #[test]
    fn skips_fstring_literals_as_dynamic_not_literal() {
        let source = "with open(f\"data/{name}.json\") as f:\n    pass\n";
        let moved = vec!["data/products.json".to_string()];
        assert!(patch_source(source, &moved).unwrap().is_none());
    }

    #[test]
    fn detects_os_path_join_dynamic_pattern() {
        let source = "p = os.path.join(\"data\", user_id + \".json\")\n";
        let mut prefixes = BTreeSet::new();
        prefixes.insert("data".to_string());
        let warnings = scan_dynamic_paths(source, "main.py", &prefixes);
        assert!(warnings.iter().any(|w| w.kind == "join_call"));
    }

    #[test]
    fn import_inserted_after_docstring_and_import_block() {
        let source = "\"\"\"Module doc.\"\"\"\nimport os\nimport sys\n\nwith open(\"data/products.json\") as f:\n    pass\n";
        let moved = vec!["data/products.json".to_string()];
        let (patched, _) = patch_source(source, &moved).unwrap().unwrap();
        let import_line = patched
            .lines()
            .position(|l| l == "from config_paths import get_path")
            .unwrap();
        let sys_line = patched.lines().position(|l| l == "import sys").unwrap();
        assert!(import_line > sys_line);
    }
}
