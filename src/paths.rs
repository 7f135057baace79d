//! Canonical external-storage locations and the manifest they're keyed by.
//!
//! Single source of truth: every other module resolves paths through here
//! rather than re-deriving `<parent>/<name>_data` by hand.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_VERSION: u32 = 1;
pub const TOOLKIT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Legacy layout this tool must keep reading from: `<parent>/_data/<name>/LARGE_TOKENS/`.
/// Decided once per root (`ExternalLayout`) rather than branched on at every call site.
const LEGACY_DATA_DIRNAME: &str = "_data";
const LEGACY_LARGE_TOKENS_DIRNAME: &str = "LARGE_TOKENS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalLayout {
    New,
    Legacy,
}

#[derive(Debug, Clone)]
pub struct ProjectRoot {
    root: PathBuf,
    layout: ExternalLayout,
}

impl ProjectRoot {
    /// Resolves `path` to an absolute project root and decides, once, whether
    /// a populated legacy external sibling already exists for it.
    pub fn resolve(path: &Path) -> Result<Self> {
        let root = fs::canonicalize(path)
            .with_context(|| format!("project path does not exist: {}", path.display()))?;
        let layout = if legacy_external_root(&root).is_some_and(is_populated_dir) {
            ExternalLayout::Legacy
        } else {
            ExternalLayout::New
        };
        Ok(Self { root, layout })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.to_string_lossy().into_owned())
    }

    pub fn layout(&self) -> ExternalLayout {
        self.layout
    }

    /// `<parent>/<name>_data/`.
    pub fn external_root(&self) -> PathBuf {
        match self.layout {
            ExternalLayout::New => new_external_root(&self.root),
            ExternalLayout::Legacy => legacy_external_root(&self.root)
                .expect("layout decided as Legacy implies a legacy root exists"),
        }
    }

    /// `<parent>/<name>_garbage/`, always in the new-layout location.
    pub fn garbage_root(&self) -> PathBuf {
        self.root
            .parent()
            .map(|p| p.join(format!("{}_garbage", self.name())))
            .unwrap_or_else(|| PathBuf::from(format!("{}_garbage", self.name())))
    }

    pub fn external_subdir(&self, kind: ExternalKind) -> PathBuf {
        match kind {
            ExternalKind::Garbage => self.garbage_root(),
            _ => self.external_root().join(kind.dirname()),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.external_root().join("manifest.json")
    }

    /// Creates every external subdir and an empty manifest if one is absent.
    pub fn ensure_structure(&self) -> Result<()> {
        for kind in [ExternalKind::Data, ExternalKind::Venvs, ExternalKind::Logs] {
            let dir = self.external_subdir(kind);
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        fs::create_dir_all(self.garbage_root())
            .with_context(|| format!("failed to create {}", self.garbage_root().display()))?;

        let manifest_path = self.manifest_path();
        if !manifest_path.exists() {
            let manifest = Manifest::new(self.name(), self.root.clone(), self.external_root());
            save_manifest(&manifest_path, &manifest)?;
        }
        Ok(())
    }

    /// Detects a populated legacy external root distinct from the one currently in
    /// use, for the opt-in `migrate_legacy` operation (never invoked automatically).
    pub fn detect_legacy(&self) -> Option<PathBuf> {
        legacy_external_root(&self.root).filter(|p| is_populated_dir(p))
    }

    /// Copies a populated legacy external root into the new layout. Never deletes
    /// the legacy directory; the caller keeps it as a backup until satisfied.
    pub fn migrate_legacy(&self) -> Result<usize> {
        let Some(legacy_root) = self.detect_legacy() else {
            return Ok(0);
        };
        if matches!(self.layout, ExternalLayout::Legacy) {
            anyhow::bail!("refusing to migrate: the active layout for this root is already legacy");
        }

        let new_root = new_external_root(&self.root);
        fs::create_dir_all(new_root.join("data"))?;
        let mut migrated = 0usize;
        copy_dir_recursive(&legacy_root, &new_root.join("data"), &mut migrated)
            .with_context(|| "failed to migrate legacy LARGE_TOKENS directory")?;
        Ok(migrated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Data,
    Venvs,
    Logs,
    Garbage,
}

impl ExternalKind {
    fn dirname(self) -> &'static str {
        match self {
            ExternalKind::Data => "data",
            ExternalKind::Venvs => "venvs",
            ExternalKind::Logs => "logs",
            ExternalKind::Garbage => "garbage",
        }
    }
}

fn new_external_root(root: &Path) -> PathBuf {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    root.parent()
        .map(|p| p.join(format!("{name}_data")))
        .unwrap_or_else(|| PathBuf::from(format!("{name}_data")))
}

fn legacy_external_root(root: &Path) -> Option<PathBuf> {
    let name = root.file_name()?.to_string_lossy().into_owned();
    let parent = root.parent()?;
    let candidate = parent
        .join(LEGACY_DATA_DIRNAME)
        .join(name)
        .join(LEGACY_LARGE_TOKENS_DIRNAME);
    candidate.exists().then_some(candidate)
}

fn is_populated_dir(p: PathBuf) -> bool {
    fs::read_dir(&p)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn copy_dir_recursive(src: &Path, dst: &Path, counter: &mut usize) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if from.is_dir() {
            copy_dir_recursive(&from, &to, counter)?;
        } else {
            fs::copy(&from, &to)?;
            *counter += 1;
        }
    }
    Ok(())
}

// ───────────────────────────── Manifest ─────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovedFile {
    pub project_relative_path: String,
    pub external_relative_path: String,
    pub size_bytes: u64,
    pub tokens: u64,
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    pub moved_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub project_name: String,
    pub project_path: String,
    pub external_dir: String,
    pub created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    pub toolkit_version: String,
    pub total_files: usize,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_tokens: Option<u64>,
    pub files: Vec<MovedFile>,
}

impl Manifest {
    pub fn new(project_name: String, project_path: PathBuf, external_dir: PathBuf) -> Self {
        Self {
            version: MANIFEST_VERSION,
            project_name,
            project_path: project_path.to_string_lossy().replace('\\', "/"),
            external_dir: external_dir.to_string_lossy().replace('\\', "/"),
            created: Utc::now().to_rfc3339(),
            updated_at: None,
            toolkit_version: TOOLKIT_VERSION.to_string(),
            total_files: 0,
            total_tokens: 0,
            original_tokens: None,
            files: Vec::new(),
        }
    }

    /// Adds or replaces the entry for `file.project_relative_path`, keeping the
    /// uniqueness invariant over `project_relative_path`.
    pub fn add_or_replace(&mut self, file: MovedFile) {
        self.files
            .retain(|f| f.project_relative_path != file.project_relative_path);
        self.files.push(file);
        self.total_files = self.files.len();
        self.total_tokens = self.files.iter().map(|f| f.tokens).sum();
    }

    pub fn already_moved(&self) -> std::collections::HashSet<String> {
        self.files
            .iter()
            .map(|f| f.project_relative_path.clone())
            .collect()
    }
}

pub fn load_manifest(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        anyhow::bail!("manifest not found at {}", path.display());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest at {}", path.display()))?;
    let manifest: Manifest = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse manifest at {}", path.display()))?;
    if manifest.version > MANIFEST_VERSION {
        anyhow::bail!(
            "manifest at {} is version {}, newer than this tool understands ({}); upgrade the tool before proceeding",
            path.display(),
            manifest.version,
            MANIFEST_VERSION
        );
    }
    Ok(manifest)
}

pub fn try_load_manifest(path: &Path) -> Result<Option<Manifest>> {
    if !path.exists() {
        return Ok(None);
    }
    load_manifest(path).map(Some)
}

pub fn save_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    let mut manifest = manifest.clone();
    manifest.updated_at = Some(Utc::now().to_rfc3339());
    let json = serde_json::to_string_pretty(&manifest).context("failed to serialize manifest")?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename manifest into place at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn external_root_is_sibling_named_after_project() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("myproj");
        fs::create_dir_all(&project).unwrap();
        let root = ProjectRoot::resolve(&project).unwrap();
        assert_eq!(root.layout(), ExternalLayout::New);
        assert_eq!(
            root.external_root(),
            fs::canonicalize(dir.path()).unwrap().join("myproj_data")
        );
    }

    #[test]
    fn legacy_layout_is_detected_when_populated() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("myproj");
        fs::create_dir_all(&project).unwrap();
        let legacy = fs::canonicalize(dir.path())
            .unwrap()
            .join("_data")
            .join("myproj")
            .join("LARGE_TOKENS");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join("seed.json"), b"{}").unwrap();

        let root = ProjectRoot::resolve(&project).unwrap();
        assert_eq!(root.layout(), ExternalLayout::Legacy);
        assert_eq!(root.external_root(), legacy);
    }

    #[test]
    fn manifest_add_or_replace_is_keyed_by_relative_path() {
        let mut m = Manifest::new("p".into(), PathBuf::from("/p"), PathBuf::from("/p_data"));
        let f = |tokens| MovedFile {
            project_relative_path: "data/a.json".into(),
            external_relative_path: "data/a.json".into(),
            size_bytes: 10,
            tokens,
            category: "Data".into(),
            schema: None,
            moved_at: "now".into(),
        };
        m.add_or_replace(f(5));
        m.add_or_replace(f(7));
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.files[0].tokens, 7);
        assert_eq!(m.total_files, 1);
    }

    #[test]
    fn save_and_load_roundtrip_sets_updated_at() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let m = Manifest::new("p".into(), PathBuf::from("/p"), PathBuf::from("/p_data"));
        save_manifest(&path, &m).unwrap();
        let loaded = load_manifest(&path).unwrap();
        assert!(loaded.updated_at.is_some());
        assert_eq!(loaded.project_name, "p");
    }

    #[test]
    fn unknown_major_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, r#"{"version":999,"project_name":"p","project_path":"/p","external_dir":"/p_data","created":"now","toolkit_version":"1.0.0","total_files":0,"total_tokens":0,"files":[]}"#).unwrap();
        let err = load_manifest(&path).unwrap_err();
        assert!(err.to_string().contains("newer than this tool understands"));
    }
}
