//! Per-agent home directories.
//!
//! Every agent gets a filesystem area derived from its pubkey prefix,
//! always writable by that agent. Files whose names begin with `+` are
//! injected into the agent's system prompt, alphabetically, bounded in
//! size. Symlinks are rejected throughout so a home can never alias
//! content from outside itself.

use std::path::{Path, PathBuf};

use cv_domain::error::{Error, Result};

/// Pubkey characters used for the directory name.
const HOME_PREFIX_LEN: usize = 12;
/// Cap on injected context files.
const MAX_CONTEXT_FILES: usize = 10;
/// Per-file character bound for injected content.
const MAX_CONTEXT_CHARS: usize = 1500;

/// Handle to one agent's home directory.
#[derive(Debug, Clone)]
pub struct AgentHome {
    path: PathBuf,
}

impl AgentHome {
    /// Resolve (and create) the home for a pubkey under `base`.
    pub fn for_pubkey(base: &Path, pubkey: &str) -> Result<Self> {
        let prefix: String = pubkey.chars().take(HOME_PREFIX_LEN).collect();
        if prefix.is_empty() {
            return Err(Error::Validation("pubkey must not be empty".into()));
        }
        let path = base.join("homes").join(prefix);
        std::fs::create_dir_all(&path).map_err(Error::Io)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Context files to inject into the system prompt: names beginning
    /// with `+`, alphabetical, at most [`MAX_CONTEXT_FILES`] of them, each
    /// clipped to [`MAX_CONTEXT_CHARS`] characters. Symlinks are skipped.
    pub fn context_files(&self) -> Vec<(String, String)> {
        let Ok(read_dir) = std::fs::read_dir(&self.path) else {
            return Vec::new();
        };

        let mut names: Vec<String> = read_dir
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                if !name.starts_with('+') {
                    return None;
                }
                // symlink_metadata sees the link itself, not its target.
                let meta = e.path().symlink_metadata().ok()?;
                if meta.file_type().is_symlink() || !meta.is_file() {
                    tracing::warn!(file = %name, "skipping non-regular context file");
                    return None;
                }
                Some(name)
            })
            .collect();
        names.sort();
        names.truncate(MAX_CONTEXT_FILES);

        names
            .into_iter()
            .filter_map(|name| {
                let content = std::fs::read_to_string(self.path.join(&name)).ok()?;
                let clipped: String = content.chars().take(MAX_CONTEXT_CHARS).collect();
                Some((name, clipped))
            })
            .collect()
    }
}
