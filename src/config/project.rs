//! Project files.
//!
//! A project file is line-oriented `KEY = value` text naming the script,
//! the persisted context and optional side files:
//!
//! ```text
//! SCRIPT_PATH = analysis.py
//! CONTEXT_PATH = well.ctx.json
//! LAYOUT_PATH = layout.json
//! DEPTH_INTERACTOR_RANGE_FILE = ranges/depth.json
//! SAVED_CONTEXTS_BASELINE = saved/baseline.json
//! ```
//!
//! Keys are case-insensitive on read and written in upper case. Blank
//! lines and `#` comments are ignored. Relative paths resolve against the
//! directory holding the project file.

use crate::error::{FlowError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Project file extension
pub const PROJECT_FILE_EXTENSION: &str = "flowproj";

const SCRIPT_PATH: &str = "SCRIPT_PATH";
const CONTEXT_PATH: &str = "CONTEXT_PATH";
const LAYOUT_PATH: &str = "LAYOUT_PATH";
const INTERACTOR_SUFFIX: &str = "_INTERACTOR_RANGE_FILE";
const SAVED_CONTEXTS_PREFIX: &str = "SAVED_CONTEXTS_";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectFile {
    /// Directory relative paths resolve against
    pub base_dir: PathBuf,
    pub script_path: PathBuf,
    pub context_path: PathBuf,
    pub layout_path: Option<PathBuf>,
    /// Interactor name (upper case) → range file
    pub interactor_ranges: BTreeMap<String, PathBuf>,
    /// Saved-context key (upper case) → persisted context
    pub saved_contexts: BTreeMap<String, PathBuf>,
    /// Keys this version does not interpret, kept for round trips
    pub extra: BTreeMap<String, String>,
}

impl ProjectFile {
    pub fn new(script_path: impl Into<PathBuf>, context_path: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            context_path: context_path.into(),
            ..Default::default()
        }
    }

    /// Parse project text. `base_dir` anchors relative paths.
    pub fn parse(text: &str, base_dir: &Path) -> Result<Self> {
        let mut script = None;
        let mut context = None;
        let mut project = ProjectFile {
            base_dir: base_dir.to_path_buf(),
            ..Default::default()
        };

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| FlowError::Parse {
                line: number + 1,
                message: format!("expected KEY = value, found '{line}'"),
            })?;
            let key = key.trim().to_uppercase();
            let value = value.trim();
            if value.is_empty() {
                return Err(FlowError::Parse {
                    line: number + 1,
                    message: format!("{key} has no value"),
                });
            }
            let path = resolve(base_dir, value);

            match key.as_str() {
                SCRIPT_PATH => script = Some(path),
                CONTEXT_PATH => context = Some(path),
                LAYOUT_PATH => project.layout_path = Some(path),
                _ => {
                    if let Some(name) = key.strip_suffix(INTERACTOR_SUFFIX).filter(|n| !n.is_empty()) {
                        project.interactor_ranges.insert(name.to_string(), path);
                    } else if let Some(name) = key.strip_prefix(SAVED_CONTEXTS_PREFIX).filter(|n| !n.is_empty()) {
                        project.saved_contexts.insert(name.to_string(), path);
                    } else {
                        warn!(key = %key, "Unknown project key");
                        project.extra.insert(key, value.to_string());
                    }
                }
            }
        }

        project.script_path =
            script.ok_or_else(|| FlowError::Config(format!("project is missing {SCRIPT_PATH}")))?;
        project.context_path =
            context.ok_or_else(|| FlowError::Config(format!("project is missing {CONTEXT_PATH}")))?;
        Ok(project)
    }

    /// Load a project file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowError::Config(format!("Failed to read project file {:?}: {}", path, e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let project = Self::parse(&content, base_dir)
            .map_err(|e| e.with_context(format!("project file {}", path.display())))?;
        info!(
            project = %path.display(),
            script = %project.script_path.display(),
            saved_contexts = project.saved_contexts.len(),
            "Project loaded"
        );
        Ok(project)
    }

    /// Project text with upper-case keys in a fixed order. Paths under
    /// `base_dir` are written relative to it.
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("{SCRIPT_PATH} = {}", self.relative(&self.script_path)),
            format!("{CONTEXT_PATH} = {}", self.relative(&self.context_path)),
        ];
        if let Some(layout) = &self.layout_path {
            lines.push(format!("{LAYOUT_PATH} = {}", self.relative(layout)));
        }
        for (name, path) in &self.interactor_ranges {
            lines.push(format!("{}{INTERACTOR_SUFFIX} = {}", name.to_uppercase(), self.relative(path)));
        }
        for (key, path) in &self.saved_contexts {
            lines.push(format!("{SAVED_CONTEXTS_PREFIX}{} = {}", key.to_uppercase(), self.relative(path)));
        }
        for (key, value) in &self.extra {
            lines.push(format!("{} = {value}", key.to_uppercase()));
        }
        lines.join("\n") + "\n"
    }

    /// Save the project file to disk
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                FlowError::Config(format!("Failed to create project directory: {}", e))
            })?;
        }
        std::fs::write(path, self.render()).map_err(|e| {
            FlowError::Config(format!("Failed to write project file {:?}: {}", path, e))
        })
    }

    pub fn saved_context(&self, key: &str) -> Option<&Path> {
        self.saved_contexts.get(&key.to_uppercase()).map(PathBuf::as_path)
    }

    pub fn with_saved_context(mut self, key: &str, path: impl Into<PathBuf>) -> Self {
        self.saved_contexts.insert(key.to_uppercase(), path.into());
        self
    }

    pub fn with_layout(mut self, path: impl Into<PathBuf>) -> Self {
        self.layout_path = Some(path.into());
        self
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_dir)
            .ok()
            .filter(|p| !p.as_os_str().is_empty() && !self.base_dir.as_os_str().is_empty())
            .unwrap_or(path)
            .display()
            .to_string()
    }
}

fn resolve(base_dir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_keys_are_case_insensitive() {
        let text = "\
# analysis project
script_path = analysis.py
  Context_Path=data/well.json
depth_interactor_range_file = ranges/depth.json
saved_contexts_baseline = saved/base.json
";
        let project = ProjectFile::parse(text, Path::new("/proj")).unwrap();
        assert_eq!(project.script_path, PathBuf::from("/proj/analysis.py"));
        assert_eq!(project.context_path, PathBuf::from("/proj/data/well.json"));
        assert_eq!(
            project.interactor_ranges.get("DEPTH"),
            Some(&PathBuf::from("/proj/ranges/depth.json"))
        );
        assert_eq!(
            project.saved_context("baseline"),
            Some(Path::new("/proj/saved/base.json"))
        );
        assert!(project.layout_path.is_none());
    }

    #[test]
    fn test_required_keys() {
        let err = ProjectFile::parse("SCRIPT_PATH = a.py", Path::new(".")).unwrap_err();
        assert!(matches!(err, FlowError::Config(ref m) if m.contains("CONTEXT_PATH")));
        assert!(matches!(
            ProjectFile::parse("SCRIPT_PATH a.py", Path::new(".")),
            Err(FlowError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn test_absolute_paths_kept() {
        let project =
            ProjectFile::parse("SCRIPT_PATH = /abs/s.py\nCONTEXT_PATH = c.json", Path::new("/p")).unwrap();
        assert_eq!(project.script_path, PathBuf::from("/abs/s.py"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("demo.flowproj");
        let project = ProjectFile {
            base_dir: dir.path().to_path_buf(),
            ..ProjectFile::new(dir.path().join("s.py"), dir.path().join("ctx.json"))
        }
        .with_layout(dir.path().join("layout.json"))
        .with_saved_context("Run1", dir.path().join("saved/run1.json"));
        project.save(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("SCRIPT_PATH = s.py"));
        assert!(text.contains("SAVED_CONTEXTS_RUN1 = saved/run1.json"));

        let loaded = ProjectFile::load(&path).unwrap();
        assert_eq!(loaded, project);
    }
}
