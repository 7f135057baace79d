//! Relocator (C4): moves heavy files to external storage, maintains the
//! manifest, emits the indirection module (`config_paths.py`), creates
//! directory symlinks for dynamic-path compatibility, and keeps a tool-owned
//! section of the indexer-ignore file in sync. Also reverses all of the above
//! on restore.

use crate::config::{DeepCleanConfig, GetPathMode};
use crate::paths::{self, Manifest, MovedFile, ProjectRoot};
use crate::scanner::HeavyFile;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

const SENTINEL_BEGIN: &str = "# >>> deep-clean managed (do not edit below) >>>";
const SENTINEL_END: &str = "# <<< deep-clean managed <<<";
const BRIDGE_FILE_NAME: &str = "config_paths.py";

#[derive(Debug, Default)]
pub struct RelocateResult {
    pub moved: Vec<MovedFile>,
    pub failed: Vec<(String, String)>,
    pub symlinks_created: Vec<(String, String)>,
    pub bridge_file: Option<PathBuf>,
}

/// Moves every file in `heavy_files` into `project`'s external storage,
/// folding the result into `manifest` (keyed by relative path, so re-running
/// on an already-moved file is a no-op replace rather than a duplicate).
pub fn relocate(
    project: &ProjectRoot,
    heavy_files: &[HeavyFile],
    manifest: &mut Manifest,
    cfg: &DeepCleanConfig,
    dry_run: bool,
) -> Result<RelocateResult> {
    let external_root = project.external_root();
    if !dry_run {
        project.ensure_structure()?;
    }

    let mut result = RelocateResult::default();

    for hf in heavy_files {
        let dest = external_root.join("data").join(&hf.project_relative_path);
        if !dry_run {
            if let Some(parent) = dest.parent() {
                if let Err(e) = fs::create_dir_all(parent) {
                    result
                        .failed
                        .push((hf.project_relative_path.clone(), e.to_string()));
                    continue;
                }
            }
            if let Err(e) = fs::rename(&hf.absolute_path, &dest) {
                result
                    .failed
                    .push((hf.project_relative_path.clone(), e.to_string()));
                continue;
            }
        }

        let external_relative = Path::new("data")
            .join(&hf.project_relative_path)
            .to_string_lossy()
            .replace('\\', "/");

        let moved = MovedFile {
            project_relative_path: hf.project_relative_path.clone(),
            external_relative_path: external_relative,
            size_bytes: hf.size_bytes,
            tokens: hf.estimated_tokens,
            category: hf.category.as_str().to_string(),
            schema: hf.schema.clone(),
            moved_at: Utc::now().to_rfc3339(),
        };
        manifest.add_or_replace(moved.clone());
        result.moved.push(moved);
    }

    if dry_run {
        return Ok(result);
    }

    if !result.moved.is_empty() || !manifest.files.is_empty() {
        paths::save_manifest(&project.manifest_path(), manifest)?;
        result.bridge_file = Some(generate_bridge_module(project, manifest, cfg)?);
        update_ignore_file(project, manifest, cfg)?;
        result.symlinks_created = create_symlinks(project, &result.moved)?;
    }

    Ok(result)
}

/// Creates `<root>/<top-level-segment>` → `<external>/data/<top-level-segment>`
/// symlinks for every top-level directory that was fully vacated by this move.
/// Failures (missing platform support, permissions) are collected, never fatal.
pub fn create_symlinks(
    project: &ProjectRoot,
    moved: &[MovedFile],
) -> Result<Vec<(String, String)>> {
    let mut top_level_dirs = std::collections::BTreeSet::new();
    for mf in moved {
        if let Some(first) = Path::new(&mf.project_relative_path).components().next() {
            let first = first.as_os_str().to_string_lossy().into_owned();
            if Path::new(&mf.project_relative_path)
                .components()
                .count()
                > 1
            {
                top_level_dirs.insert(first);
            }
        }
    }

    let external_data = project.external_root().join("data");
    let mut created = Vec::new();

    for dir_name in top_level_dirs {
        let link_path = project.path().join(&dir_name);
        let target_path = external_data.join(&dir_name);
        if !target_path.exists() {
            continue;
        }
        if link_path.is_symlink() {
            continue;
        }
        if link_path.exists() {
            let remaining = fs::read_dir(&link_path)
                .map(|mut it| it.next().is_some())
                .unwrap_or(true);
            if remaining {
                continue;
            }
            if fs::remove_dir(&link_path).is_err() {
                continue;
            }
        }

        let rel_target = pathdiff(&target_path, link_path.parent().unwrap_or(project.path()));
        if symlink_dir(&rel_target, &link_path).is_ok() {
            created.push((dir_name, rel_target.to_string_lossy().into_owned()));
        }
    }

    Ok(created)
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

fn pathdiff(target: &Path, from: &Path) -> PathBuf {
    pathdiff::diff_paths(target, from).unwrap_or_else(|| target.to_path_buf())
}

/// Removes every direct child of `project_root` that is a symlink resolving
/// into `external_root` (i.e. one `create_symlinks` made). Leaves everything
/// else untouched.
fn remove_relocation_symlinks(project_root: &Path, external_root: &Path) -> Result<()> {
    let Ok(entries) = fs::read_dir(project_root) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !meta.file_type().is_symlink() {
            continue;
        }
        let Ok(target) = fs::read_link(&path) else {
            continue;
        };
        let resolved = if target.is_absolute() {
            target
        } else {
            path.parent().unwrap_or(project_root).join(&target)
        };
        if !resolved.starts_with(external_root) {
            continue;
        }
        if fs::remove_file(&path).is_err() {
            fs::remove_dir(&path)
                .with_context(|| format!("failed to remove relocation symlink {}", path.display()))?;
        }
    }
    Ok(())
}

/// Emits `config_paths.py` at the project root. Regenerated wholesale on every
/// call (never patched), covering the full manifest (old + newly moved files).
pub fn generate_bridge_module(
    project: &ProjectRoot,
    manifest: &Manifest,
    cfg: &DeepCleanConfig,
) -> Result<PathBuf> {
    let project_name = project.name();
    let mode_doc = match cfg.get_path_mode {
        GetPathMode::Strict => "strict: raises FileNotFoundError on a miss",
        GetPathMode::Fallback => "fallback: returns the original path unchanged on a miss",
    };

    let mut mappings = String::new();
    let mut schemas = String::new();
    for mf in &manifest.files {
        let key = mf.project_relative_path.replace('\\', "/");
        mappings.push_str(&format!("    \"{key}\": EXTERNAL_DATA / \"{key}\",\n"));
        if let Some(schema) = &mf.schema {
            let mut schema_str =
                serde_json::to_string_pretty(schema).unwrap_or_else(|_| "{}".to_string());
            schema_str = schema_str
                .replace("true", "True")
                .replace("false", "False")
                .replace("null", "None");
            schemas.push_str(&format!("    \"{key}\": {schema_str},\n"));
        }
    }
    if schemas.is_empty() {
        schemas.push_str("    # No schemas extracted\n");
    }

    let get_path_body = match cfg.get_path_mode {
        GetPathMode::Strict => {
            r#"    if normalized in FILES_MAP:
        return FILES_MAP[normalized]
    raise FileNotFoundError(
        f"No external mapping for: {original}\n"
        f"Available files: {list(FILES_MAP.keys())}"
    )"#
        }
        GetPathMode::Fallback => {
            r#"    if normalized in FILES_MAP:
        return FILES_MAP[normalized]
    return Path(original)"#
        }
    };

    let code = format!(
        r#""""
Auto-generated. DO NOT EDIT — regenerate by re-running deep-clean.

Generated: {generated}
Project: {project_name}
Files tracked: {file_count}
get_path miss behavior: {mode_doc}
"""
from pathlib import Path

# External storage location, relative to project root: ../{project_name}_data/
EXTERNAL_DATA = Path(__file__).parent.parent / "{project_name}_data" / "data"

# File mappings (original relative path -> external Path)
FILES_MAP = {{
{mappings}}}


def get_path(original: str) -> Path:
    """Resolve the external path for a relocated file's original location."""
    normalized = original.replace("\\", "/")
{get_path_body}


def exists(original: str) -> bool:
    """Whether `original` has a tracked external mapping and file."""
    try:
        return get_path(original).exists()
    except FileNotFoundError:
        return False


def list_files() -> list:
    """Every original relative path this bridge knows about."""
    return list(FILES_MAP.keys())


# Schemas (structure without data, for AI context)
SCHEMAS = {{
{schemas}}}


def get_schema(original: str) -> dict:
    """Schema for a relocated file, or an empty dict if none was extracted."""
    normalized = original.replace("\\", "/")
    return SCHEMAS.get(normalized, {{}})
"#,
        generated = Utc::now().to_rfc3339(),
        project_name = project_name,
        file_count = manifest.files.len(),
        mode_doc = mode_doc,
        mappings = mappings,
        get_path_body = get_path_body,
        schemas = schemas,
    );

    let bridge_path = project.path().join(BRIDGE_FILE_NAME);
    fs::write(&bridge_path, code)
        .with_context(|| format!("failed to write {}", bridge_path.display()))?;
    Ok(bridge_path)
}

/// Rewrites the tool-owned section of the project's ignore file (delimited by
/// [`SENTINEL_BEGIN`]/[`SENTINEL_END`]), leaving every other line byte-preserved.
pub fn update_ignore_file(
    project: &ProjectRoot,
    manifest: &Manifest,
    cfg: &DeepCleanConfig,
) -> Result<()> {
    let ignore_path = project.path().join(&cfg.ignore_file_name);
    let existing = fs::read_to_string(&ignore_path).unwrap_or_default();
    let preserved = strip_managed_section(&existing);

    let external_relative = format!("../{}_data/", project.name());
    let mut section = String::new();
    section.push('\n');
    section.push_str(SENTINEL_BEGIN);
    section.push('\n');
    section.push_str("# Files moved to external storage by deep-clean\n");
    section.push_str(&format!("# External storage: {external_relative}\n\n"));

    let mut dirs_with_moved = std::collections::BTreeSet::new();
    for mf in &manifest.files {
        let rel = mf.project_relative_path.replace('\\', "/");
        let parts: Vec<&str> = rel.rsplitn(2, '/').collect();
        if parts.len() == 1 {
            section.push_str(&rel);
            section.push('\n');
        } else {
            dirs_with_moved.insert(parts[1].to_string());
        }
    }
    for dir in &dirs_with_moved {
        let dir_full = project.path().join(dir);
        let remaining = count_files(&dir_full);
        if remaining <= 2 {
            section.push_str(&format!("{dir}/*\n"));
        }
    }
    section.push_str(&format!("\n# External storage directory\n{external_relative}\n"));
    section.push_str(SENTINEL_END);
    section.push('\n');

    let final_content = format!("{}{}", preserved.trim_end(), section);
    fs::write(&ignore_path, final_content)
        .with_context(|| format!("failed to write {}", ignore_path.display()))?;
    Ok(())
}

fn strip_managed_section(content: &str) -> String {
    let Some(start) = content.find(SENTINEL_BEGIN) else {
        return content.to_string();
    };
    let before = &content[..start];
    match content[start..].find(SENTINEL_END) {
        Some(end_rel) => {
            let after_start = start + end_rel + SENTINEL_END.len();
            format!("{}{}", before, &content[after_start..])
        }
        None => before.to_string(),
    }
}

fn count_files(dir: &Path) -> usize {
    fn walk(dir: &Path, count: &mut usize) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(&path, count);
            } else {
                *count += 1;
            }
        }
    }
    let mut count = 0;
    if dir.exists() {
        walk(dir, &mut count);
    }
    count
}

#[derive(Debug, Default)]
pub struct RestoreResult {
    pub restored_files: usize,
}

/// Moves every manifest-tracked file back to its original location, deletes
/// the bridge module and manifest, and removes the ignore file's managed
/// section. Missing manifest is a hard error; the project is left untouched.
pub fn restore(project: &ProjectRoot, cfg: &DeepCleanConfig) -> Result<RestoreResult> {
    let manifest_path = project.manifest_path();
    let manifest = paths::try_load_manifest(&manifest_path)?.ok_or_else(|| {
        anyhow::anyhow!(
            "no manifest found at {}; nothing to restore",
            manifest_path.display()
        )
    })?;

    let external_root = PathBuf::from(&manifest.external_dir);
    let mut result = RestoreResult::default();

    // A vacated top-level dir may have been replaced with a symlink into
    // external storage (see `create_symlinks`). Remove it first so the
    // per-file loop below recreates a real directory and the rename actually
    // moves data out of external storage instead of renaming onto itself
    // through the symlink.
    remove_relocation_symlinks(project.path(), &external_root)?;

    for file in &manifest.files {
        let external_path = external_root.join(&file.external_relative_path);
        let original_path = project.path().join(&file.project_relative_path);
        if !external_path.exists() {
            continue;
        }
        if let Some(parent) = original_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::rename(&external_path, &original_path).with_context(|| {
            format!(
                "failed to restore {} from {}",
                original_path.display(),
                external_path.display()
            )
        })?;
        result.restored_files += 1;
    }

    let bridge_path = project.path().join(BRIDGE_FILE_NAME);
    if bridge_path.exists() {
        fs::remove_file(&bridge_path)
            .with_context(|| format!("failed to remove {}", bridge_path.display()))?;
    }

    let ignore_path = project.path().join(&cfg.ignore_file_name);
    if let Ok(existing) = fs::read_to_string(&ignore_path) {
        let stripped = strip_managed_section(&existing);
        fs::write(&ignore_path, stripped.trim_end().to_string() + "\n")
            .with_context(|| format!("failed to write {}", ignore_path.display()))?;
    }

    if manifest_path.exists() {
        fs::remove_file(&manifest_path)
            .with_context(|| format!("failed to remove {}", manifest_path.display()))?;
    }
    if external_root.exists() && count_files(&external_root) == 0 {
        let _ = remove_empty_dirs(&external_root);
    }

    Ok(result)
}

fn remove_empty_dirs(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            remove_empty_dirs(&path)?;
            let _ = fs::remove_dir(&path);
        }
    }
    fs::remove_dir(dir)
}

mod pathdiff {
    use std::path::{Component, Path, PathBuf};

    /// Minimal relative-path diff: used only for symlink targets, where both
    /// sides are always absolute, canonicalized paths under the same project
    /// parent directory.
    pub fn diff_paths(target: &Path, from: &Path) -> Option<PathBuf> {
        let target_comps: Vec<Component> = target.components().collect();
        let from_comps: Vec<Component> = from.components().collect();

        let common = target_comps
            .iter()
            .zip(from_comps.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let mut result = PathBuf::new();
        for _ in common..from_comps.len() {
            result.push("..");
        }
        for comp in &target_comps[common..] {
            result.push(comp.as_os_str());
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_managed_section_removes_only_sentinel_block() {
        let content = format!(
            "keep me\n\n{}\nfoo.json\n{}\nkeep me too\n",
            SENTINEL_BEGIN, SENTINEL_END
        );
        let stripped = strip_managed_section(&content);
        assert!(stripped.contains("keep me"));
        assert!(stripped.contains("keep me too"));
        assert!(!stripped.contains("foo.json"));
    }

    #[test]
    fn strip_managed_section_is_noop_without_sentinel() {
        let content = "a\nb\nc\n";
        assert_eq!(strip_managed_section(content), content);
    }

    #[test]
    fn pathdiff_computes_relative_sibling() {
        let target = Path::new("/a/b_data/data/x");
        let from = Path::new("/a/b");
        let rel = pathdiff::diff_paths(target, from).unwrap();
        assert_eq!(rel, PathBuf::from("../b_data/data/x"));
    }
}
