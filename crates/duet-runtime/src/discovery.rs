//! Test script discovery under `<root>/<category>/tests/`.

use std::path::{Path, PathBuf};

/// One runnable test script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// First directory below the root (`cashflows`, `currencies`, ...).
    pub category: String,
    pub path: PathBuf,
}

impl Script {
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_python(&self) -> bool {
        self.path.extension().is_some_and(|ext| ext == "py")
    }

    /// Program and arguments to launch this script.
    pub fn command(&self, python: &str) -> (String, Vec<String>) {
        let path = self.path.to_string_lossy().into_owned();
        if self.is_python() {
            (python.to_owned(), vec![path])
        } else {
            (path, Vec::new())
        }
    }
}

/// Scripts sorted by category, then file name.
pub fn discover(root: &Path) -> Result<Vec<Script>, glob::PatternError> {
    let pattern = format!("{}/*/tests/**/*", glob::Pattern::escape(&root.to_string_lossy()));
    let mut scripts: Vec<Script> = glob::glob(&pattern)?
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(err) => {
                tracing::debug!(error = %err, "skipping unreadable path");
                None
            }
        })
        .filter(|path| is_test_script(path))
        .filter_map(|path| {
            let category = path
                .strip_prefix(root)
                .ok()?
                .components()
                .next()?
                .as_os_str()
                .to_string_lossy()
                .into_owned();
            Some(Script { category, path })
        })
        .collect();
    scripts.sort_by(|a, b| (&a.category, a.name()).cmp(&(&b.category, b.name())));
    tracing::debug!(root = %root.display(), count = scripts.len(), "discovered test scripts");
    Ok(scripts)
}

fn is_test_script(path: &Path) -> bool {
    if !path.is_file() || !is_executable(path) {
        return false;
    }
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    matches!(ext, "sh" | "py") && (stem.starts_with("test_") || stem.starts_with("run_") || stem.ends_with("_tests"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata().is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}
