use std::path::{Component, Path, PathBuf};

/// Confines mutating tools to the workspace directory.
/// Reads are unrestricted; writes and deletes must resolve inside the root.
#[derive(Debug, Clone)]
pub struct WorkspaceGuard {
    /// Canonical (absolute, symlinks resolved) workspace root.
    canonical_root: PathBuf,
}

impl WorkspaceGuard {
    /// Creates the directory if it doesn't exist and resolves it.
    pub fn new(workspace_path: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(workspace_path)?;
        let canonical_root = std::fs::canonicalize(workspace_path)?;
        Ok(Self { canonical_root })
    }

    /// Relative paths resolve against the workspace; absolute ones as-is.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.canonical_root.join(path)
        }
    }

    /// Resolve `path` for mutation, refusing anything outside the workspace.
    ///
    /// The nearest existing ancestor is canonicalised so symlinks cannot be
    /// used to escape; `..` in the not-yet-existing tail is applied lexically
    /// and the result must still lie inside the root.
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let target = self.resolve(path);
        let mut existing = target.as_path();
        let mut tail: Vec<Component> = Vec::new();
        while !existing.exists() {
            let name = existing
                .components()
                .next_back()
                .ok_or_else(|| format!("path '{path}' has no existing ancestor"))?;
            tail.push(name);
            existing = existing
                .parent()
                .ok_or_else(|| format!("path '{path}' has no existing ancestor"))?;
        }
        let mut canonical = std::fs::canonicalize(existing)
            .map_err(|e| format!("failed to resolve '{path}': {e}"))?;
        for component in tail.into_iter().rev() {
            match component {
                Component::Normal(part) => canonical.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    canonical.pop();
                }
                _ => return Err(format!("path '{path}' is outside the workspace directory")),
            }
        }
        if canonical.starts_with(&self.canonical_root) {
            Ok(canonical)
        } else {
            Err(format!("path '{path}' is outside the workspace directory"))
        }
    }

    pub fn canonical_root(&self) -> &Path {
        &self.canonical_root
    }

    /// Lock key for a path argument. Every spelling of one file yields the
    /// same key: workspace files relative to the root, anything else as a
    /// normalised absolute path.
    pub fn lock_key(&self, path: &str) -> String {
        let path = path.trim();
        let resolved = self
            .resolve_for_write(path)
            .ok()
            .or_else(|| std::fs::canonicalize(self.resolve(path)).ok())
            .unwrap_or_else(|| normalize_lexically(&self.resolve(path)));
        match resolved.strip_prefix(&self.canonical_root) {
            Ok(relative) => relative.to_string_lossy().into_owned(),
            Err(_) => resolved.to_string_lossy().into_owned(),
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
