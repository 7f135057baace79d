//! Token-weighted file scanner (C2): walks a project, classifies files by
//! category, estimates token weight, and flags files at or above a threshold.

use crate::config::DeepCleanConfig;
use crate::schema;
use anyhow::Result;
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileCategory {
    Data,
    Database,
    Code,
    Log,
    Binary,
    Config,
    Unknown,
}

impl FileCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FileCategory::Data => "Data",
            FileCategory::Database => "Database",
            FileCategory::Code => "Code",
            FileCategory::Log => "Log",
            FileCategory::Binary => "Binary",
            FileCategory::Config => "Config",
            FileCategory::Unknown => "Unknown",
        }
    }
}

const DATA_EXTENSIONS: &[&str] = &["json", "csv", "yaml", "yml", "xml", "jsonl"];
const DATABASE_EXTENSIONS: &[&str] = &["sqlite", "sqlite3", "db"];
const CODE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "java", "go", "rs", "cpp", "c", "h",
];
const CONFIG_EXTENSIONS: &[&str] = &["ini", "toml", "cfg", "conf", "env"];
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "webp", "svg", "mp3", "mp4", "wav", "avi", "mov", "zip",
    "tar", "gz", "rar", "7z", "bz2", "exe", "dll", "so", "dylib", "woff", "woff2", "ttf", "eot",
    "pyc", "pyo", "pyd",
];
/// Extensions recognized by the schema extractor (C3).
pub const SCHEMA_EXTENSIONS: &[&str] = &["json", "csv", "sqlite", "sqlite3", "db", "yaml", "yml"];

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

fn ext_lower(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

pub fn categorize_file(path: &Path) -> FileCategory {
    let ext = ext_lower(path);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if DATA_EXTENSIONS.contains(&ext.as_str()) {
        return FileCategory::Data;
    }
    if DATABASE_EXTENSIONS.contains(&ext.as_str()) {
        return FileCategory::Database;
    }
    if CODE_EXTENSIONS.contains(&ext.as_str()) {
        return FileCategory::Code;
    }
    if ext == "log" || name.ends_with(".log") {
        return FileCategory::Log;
    }
    if BINARY_EXTENSIONS.contains(&ext.as_str()) {
        return FileCategory::Binary;
    }
    if CONFIG_EXTENSIONS.contains(&ext.as_str()) {
        return FileCategory::Config;
    }
    if name.contains("log") {
        return FileCategory::Log;
    }
    FileCategory::Unknown
}

/// `floor(size_bytes / 4)`, `0` for `Binary`. Coarse by design — see Open
/// Question #3 in DESIGN.md: a future tokenizer swap must preserve this unit.
pub fn estimate_tokens(size_bytes: u64, category: FileCategory) -> u64 {
    if category == FileCategory::Binary {
        0
    } else {
        size_bytes / 4
    }
}

fn should_skip_dir(name: &str, extra_excludes: &[String]) -> bool {
    if SKIP_DIRS.contains(&name) || name.ends_with(".egg-info") {
        return true;
    }
    if name.starts_with('.') && name != ".github" {
        return true;
    }
    extra_excludes.iter().any(|e| e == name)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeavyFile {
    pub absolute_path: PathBuf,
    pub project_relative_path: String,
    pub size_bytes: u64,
    pub estimated_tokens: u64,
    pub category: FileCategory,
    pub can_extract_schema: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct ScanResult {
    pub total_files_scanned: usize,
    pub total_tokens: u64,
    pub heavy_files: Vec<HeavyFile>,
    pub skipped_dirs: Vec<String>,
    pub errors: Vec<String>,
}

impl ScanResult {
    pub fn heavy_tokens(&self) -> u64 {
        self.heavy_files.iter().map(|f| f.estimated_tokens).sum()
    }
}

/// Walks `root`, skipping the fixed skip-set plus `root`'s own external/garbage
/// siblings, and returns every file whose estimated tokens meet `threshold`.
///
/// Uses `ignore::WalkBuilder` for the traversal itself (honours `.gitignore`
/// the way a developer's editor would); `filter_entry` layers the skip-dir
/// set and the external/garbage exclusion on top, recording what it prunes.
pub fn scan_project(
    root: &Path,
    external_root: &Path,
    garbage_root: &Path,
    cfg: &DeepCleanConfig,
) -> Result<ScanResult> {
    let mut result = ScanResult::default();
    let skipped: Mutex<Vec<String>> = Mutex::new(Vec::new());
    let project_root = root.to_path_buf();
    let external_root = external_root.to_path_buf();
    let garbage_root = garbage_root.to_path_buf();
    let extra_excludes = cfg.scanner_exclude_dirs.clone();

    let walker = WalkBuilder::new(root)
        .standard_filters(true)
        .filter_entry(move |entry| {
            if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
                return true;
            }
            let path = entry.path();
            if path == project_root {
                return true;
            }
            if path == external_root || path == garbage_root {
                return false;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if should_skip_dir(&name, &extra_excludes) {
                if let Ok(rel) = path.strip_prefix(&project_root) {
                    skipped.lock().unwrap().push(rel.to_string_lossy().replace('\\', "/"));
                }
                return false;
            }
            true
        })
        .build();

    for item in walker {
        let dent = match item {
            Ok(d) => d,
            Err(e) => {
                result.errors.push(e.to_string());
                continue;
            }
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let path = dent.into_path();

        let ext = ext_lower(&path);
        if BINARY_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }

        result.total_files_scanned += 1;

        let size_bytes = match std::fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(e) => {
                result.errors.push(format!("{}: {e}", path.display()));
                continue;
            }
        };

        let category = categorize_file(&path);
        let tokens = estimate_tokens(size_bytes, category);
        result.total_tokens += tokens;

        if tokens < cfg.heavy_token_threshold {
            continue;
        }
        if category == FileCategory::Code && !cfg.include_code_in_scan {
            continue;
        }
        if category == FileCategory::Binary {
            continue;
        }

        let rel = match path.strip_prefix(root) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };

        let can_extract_schema = SCHEMA_EXTENSIONS.contains(&ext.as_str());

        result.heavy_files.push(HeavyFile {
            absolute_path: path,
            project_relative_path: rel,
            size_bytes,
            estimated_tokens: tokens,
            category,
            can_extract_schema,
            schema: None,
        });
    }

    result.skipped_dirs = skipped.into_inner().unwrap();

    // Schema extraction touches disk (CSV/SQLite readers, JSON parsing) per
    // file and is independent across files — farm it out across threads the
    // same way the rest of the corpus parallelizes per-file disk work.
    result
        .heavy_files
        .par_iter_mut()
        .filter(|hf| hf.can_extract_schema)
        .for_each(|hf| {
            hf.schema = schema::extract_schema(&hf.absolute_path, cfg).ok();
        });

    result
        .heavy_files
        .sort_by(|a, b| b.estimated_tokens.cmp(&a.estimated_tokens));
    Ok(result)
}

/// Names that must never be relocated regardless of how heavy they are.
const PROTECTED_NAMES: &[&str] = &[
    "main.py",
    "__init__.py",
    "__main__.py",
    "config.py",
    "settings.py",
    "constants.py",
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    ".env",
    ".env.example",
    "readme.md",
    "config_paths.py",
];

/// Applies the safety filter: drops protected names, already-external files,
/// and `Code` files without an extractable schema. `already_moved` (by
/// project-relative path) keeps this idempotent across runs.
pub fn get_moveable(
    scan: &ScanResult,
    already_moved: &std::collections::HashSet<String>,
    cfg: &DeepCleanConfig,
) -> Vec<HeavyFile> {
    scan.heavy_files
        .iter()
        .filter(|hf| {
            let name_lower = Path::new(&hf.project_relative_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            if PROTECTED_NAMES.contains(&name_lower.as_str()) {
                return false;
            }
            if cfg
                .protected_names
                .iter()
                .filter_map(|p| glob::Pattern::new(p).ok())
                .any(|p| p.matches(&name_lower))
            {
                return false;
            }
            if already_moved.contains(&hf.project_relative_path) {
                return false;
            }
            if hf.category == FileCategory::Code && !hf.can_extract_schema {
                return false;
            }
            true
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn categorizes_by_extension_then_name_fallback() {
        assert_eq!(categorize_file(Path::new("data/a.json")), FileCategory::Data);
        assert_eq!(categorize_file(Path::new("db/a.sqlite")), FileCategory::Database);
        assert_eq!(categorize_file(Path::new("src/a.py")), FileCategory::Code);
        assert_eq!(categorize_file(Path::new("logs/app.log")), FileCategory::Log);
        assert_eq!(categorize_file(Path::new("logs/weird_name")), FileCategory::Unknown);
        assert_eq!(categorize_file(Path::new("logs/server_log_archive")), FileCategory::Log);
        assert_eq!(categorize_file(Path::new("img/a.png")), FileCategory::Binary);
    }

    #[test]
    fn token_estimate_is_bytes_over_four_and_zero_for_binary() {
        assert_eq!(estimate_tokens(4000, FileCategory::Data), 1000);
        assert_eq!(estimate_tokens(4000, FileCategory::Binary), 0);
    }

    #[test]
    fn skip_dirs_excludes_dotdirs_except_github() {
        assert!(should_skip_dir("node_modules", &[]));
        assert!(should_skip_dir(".venv", &[]));
        assert!(!should_skip_dir(".github", &[]));
        assert!(should_skip_dir("foo.egg-info", &[]));
    }

    #[test]
    fn protected_config_code_file_is_not_moveable() {
        let mut scan = ScanResult::default();
        scan.heavy_files.push(HeavyFile {
            absolute_path: PathBuf::from("/p/config.py"),
            project_relative_path: "config.py".into(),
            size_bytes: 8000,
            estimated_tokens: 2000,
            category: FileCategory::Code,
            can_extract_schema: false,
            schema: None,
        });
        let moveable = get_moveable(&scan, &Default::default(), &DeepCleanConfig::default());
        assert!(moveable.is_empty());
    }
}
