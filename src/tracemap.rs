//! Trace-Map Emitter (C6): writes `AST_FOX_TRACE.md`, a navigation map that
//! lets an AI assistant understand relocated files without reading them.

use crate::paths::{Manifest, MovedFile, ProjectRoot};
use crate::schema;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

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
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "webp", "svg", "mp3", "mp4", "wav", "avi", "mov", "zip",
    "tar", "gz", "rar", "7z", "bz2", "exe", "dll", "so", "dylib", "woff", "woff2", "ttf", "eot",
    "pyc", "pyo", "pyd",
];
const TRACE_MAP_FILE_NAME: &str = "AST_FOX_TRACE.md";
const RULE_FILE_RELATIVE_PATH: &str = ".cursor/rules/external_data.md";
const MAX_USAGE_ENTRIES: usize = 10;
const MAX_QUICK_REF_REFS: usize = 3;

fn category_icon(category: &str) -> &'static str {
    match category {
        "Data" => "📄",
        "Database" => "🗄️",
        "Log" => "📜",
        "Code" => "🧩",
        "Config" => "⚙️",
        _ => "❔",
    }
}

fn should_skip_dir(name: &str) -> bool {
    SKIP_DIRS.contains(&name) || (name.starts_with('.') && name != ".github")
}

/// Every source-relative-path -> list of 1-indexed lines referencing `needle`.
fn find_usages(project: &ProjectRoot, needle_forward: &str, needle_back: &str) -> Vec<(String, Vec<usize>)> {
    let mut out = Vec::new();
    let external_root = project.external_root();
    let garbage_root = project.garbage_root();
    collect_usages(
        project.path(),
        project.path(),
        &external_root,
        &garbage_root,
        needle_forward,
        needle_back,
        &mut out,
    );
    out
}

#[allow(clippy::too_many_arguments)]
fn collect_usages(
    dir: &Path,
    project_root: &Path,
    external_root: &Path,
    garbage_root: &Path,
    needle_forward: &str,
    needle_back: &str,
    out: &mut Vec<(String, Vec<usize>)>,
) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            if path == *external_root || path == *garbage_root {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if should_skip_dir(&name) {
                continue;
            }
            collect_usages(
                &path,
                project_root,
                external_root,
                garbage_root,
                needle_forward,
                needle_back,
                out,
            );
            continue;
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if BINARY_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        if path.file_name().map(|n| n == TRACE_MAP_FILE_NAME).unwrap_or(false) {
            continue;
        }
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        let mut lines = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.contains(needle_forward) || line.contains(needle_back) {
                lines.push(idx + 1);
            }
        }
        if !lines.is_empty() {
            let rel = path
                .strip_prefix(project_root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push((rel, lines));
        }
    }
}

fn short_name(rel_path: &str) -> String {
    Path::new(rel_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| rel_path.to_string())
}

/// Builds and writes `AST_FOX_TRACE.md` for the union of files in `manifest`.
pub fn emit_trace_map(project: &ProjectRoot, manifest: &Manifest) -> Result<PathBuf> {
    let mut usage_by_file: BTreeMap<String, Vec<(String, Vec<usize>)>> = BTreeMap::new();
    for mf in &manifest.files {
        let forward = mf.project_relative_path.replace('\\', "/");
        let back = forward.replace('/', "\\");
        usage_by_file.insert(forward.clone(), find_usages(project, &forward, &back));
    }

    let mut doc = String::new();
    doc.push_str("# AST_FOX_TRACE\n\n");
    doc.push_str("Auto-generated navigation map for relocated files. Do not edit by hand.\n\n");

    doc.push_str("## Summary\n\n");
    doc.push_str("| Files moved | Estimated tokens saved | External storage | Indirection module |\n");
    doc.push_str("|---|---|---|---|\n");
    doc.push_str(&format!(
        "| {} | {} | `{}` | `config_paths.py` |\n\n",
        manifest.total_files,
        manifest.total_tokens,
        manifest.external_dir,
    ));

    doc.push_str("## Quick reference\n\n");
    doc.push_str("| Original path | Category | Tokens | Referenced by |\n");
    doc.push_str("|---|---|---|---|\n");
    for mf in &manifest.files {
        let usages = usage_by_file.get(&mf.project_relative_path.replace('\\', "/"));
        let refs = format_quick_refs(usages);
        doc.push_str(&format!(
            "| `{}` | {} | {} | {} |\n",
            mf.project_relative_path, mf.category, mf.tokens, refs
        ));
    }
    doc.push('\n');

    doc.push_str("## Access pattern\n\n");
    doc.push_str("```python\n");
    doc.push_str("from config_paths import get_path, get_schema\n\n");
    doc.push_str("with open(get_path(\"data/products.json\")) as f:\n");
    doc.push_str("    data = json.load(f)\n\n");
    doc.push_str("schema = get_schema(\"data/products.json\")\n");
    doc.push_str("```\n\n");

    doc.push_str("## Files\n\n");
    for mf in &manifest.files {
        doc.push_str(&format_file_section(project, mf, usage_by_file.get(&mf.project_relative_path.replace('\\', "/"))));
    }

    doc.push_str("## Note to AI assistants\n\n");
    doc.push_str(
        "Do not request the full contents of a relocated file. Consult the schema above, then \
         call `get_path`/`get_schema` from `config_paths` for anything you genuinely need to read.\n",
    );

    let trace_map_path = project.path().join(TRACE_MAP_FILE_NAME);
    fs::write(&trace_map_path, doc)
        .with_context(|| format!("failed to write {}", trace_map_path.display()))?;

    write_ai_rule_file(project, manifest)?;

    Ok(trace_map_path)
}

/// Writes `.cursor/rules/external_data.md`, a short companion to
/// `AST_FOX_TRACE.md` carrying the same advisory in a directory convention
/// several AI editors scan automatically. Additive, never a replacement.
fn write_ai_rule_file(project: &ProjectRoot, manifest: &Manifest) -> Result<PathBuf> {
    let mut doc = String::new();
    doc.push_str("# External data advisory\n\n");
    doc.push_str(&format!(
        "This project relocated {} file(s) ({} estimated tokens) to external storage at `{}`. \
         See `AST_FOX_TRACE.md` at the project root for the full navigation map.\n\n",
        manifest.total_files, manifest.total_tokens, manifest.external_dir,
    ));
    doc.push_str(
        "Do not request the full contents of a relocated file. Consult `AST_FOX_TRACE.md`'s \
         schema for each file, then call `get_path`/`get_schema` from `config_paths` for anything \
         you genuinely need to read.\n",
    );

    let rule_path = project.path().join(RULE_FILE_RELATIVE_PATH);
    if let Some(parent) = rule_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&rule_path, doc)
        .with_context(|| format!("failed to write {}", rule_path.display()))?;
    Ok(rule_path)
}

fn format_quick_refs(usages: Option<&Vec<(String, Vec<usize>)>>) -> String {
    let Some(usages) = usages else {
        return "_none found_".to_string();
    };
    if usages.is_empty() {
        return "_none found_".to_string();
    }
    let mut names: Vec<String> = usages.iter().map(|(f, _)| short_name(f)).collect();
    names.sort();
    names.dedup();
    let shown = MAX_QUICK_REF_REFS.min(names.len());
    let mut out = names[..shown].join(", ");
    if names.len() > shown {
        out.push_str(&format!(" +{}", names.len() - shown));
    }
    out
}

fn format_file_section(
    project: &ProjectRoot,
    mf: &MovedFile,
    usages: Option<&Vec<(String, Vec<usize>)>>,
) -> String {
    let external_abs = PathBuf::from(&project.external_root().join(&mf.external_relative_path))
        .to_string_lossy()
        .into_owned();

    let mut section = String::new();
    section.push_str(&format!(
        "### {} `{}`\n\n",
        category_icon(&mf.category),
        mf.project_relative_path
    ));
    section.push_str(&format!("- External: `{external_abs}`\n"));
    section.push_str(&format!("- Category: {} · Tokens: {}\n\n", mf.category, mf.tokens));
    section.push_str("```python\n");
    section.push_str(&format!(
        "from config_paths import get_path\npath = get_path(\"{}\")\n",
        mf.project_relative_path
    ));
    section.push_str("```\n\n");

    if let Some(schema) = &mf.schema {
        section.push_str("**Schema**\n\n");
        section.push_str(&schema::schema_to_markdown(&mf.category, schema));
        section.push('\n');
    }

    section.push_str("**Referenced from**\n\n");
    match usages {
        Some(list) if !list.is_empty() => {
            let mut entries: Vec<String> = Vec::new();
            for (file, lines) in list {
                for line in lines {
                    entries.push(format!("- `{file}:{line}`"));
                }
            }
            let shown = MAX_USAGE_ENTRIES.min(entries.len());
            section.push_str(&entries[..shown].join("\n"));
            section.push('\n');
            if entries.len() > shown {
                section.push_str(&format!("- _+{} more_\n", entries.len() - shown));
            }
        }
        _ => section.push_str("_no references found_\n"),
    }
    section.push('\n');
    section
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Manifest;
    use std::path::PathBuf as StdPathBuf;
    use tempfile::tempdir;

    #[test]
    fn emits_trace_map_with_summary_and_file_section() {
        let dir = tempdir().unwrap();
        let project_dir = dir.path().join("proj");
        fs::create_dir_all(&project_dir).unwrap();
        fs::write(
            project_dir.join("main.py"),
            "from config_paths import get_path\nwith open(get_path(\"data/products.json\")) as f:\n    pass\n",
        )
        .unwrap();

        let root = ProjectRoot::resolve(&project_dir).unwrap();
        let mut manifest = Manifest::new(
            root.name(),
            root.path().to_path_buf(),
            root.external_root(),
        );
        manifest.add_or_replace(MovedFile {
            project_relative_path: "data/products.json".into(),
            external_relative_path: "data/products.json".into(),
            size_bytes: 3000,
            tokens: 750,
            category: "Data".into(),
            schema: None,
            moved_at: "now".into(),
        });

        let trace_path = emit_trace_map(&root, &manifest).unwrap();
        let content = fs::read_to_string(&trace_path).unwrap();
        assert!(content.contains("AST_FOX_TRACE"));
        assert!(content.contains("data/products.json"));
        assert!(content.contains("main.py:2"));
        let _ = StdPathBuf::from(&trace_path);

        let rule_path = project_dir.join(".cursor/rules/external_data.md");
        assert!(rule_path.exists());
        let rule_content = fs::read_to_string(&rule_path).unwrap();
        assert!(rule_content.contains("AST_FOX_TRACE.md"));
        assert!(rule_content.contains("get_path"));
    }
}
