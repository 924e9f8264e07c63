//! Filesystem scope enforcement for tool calls.
//!
//! Writes are restricted to the conversation's working directory and the
//! agent's home directory. Anything else requires the explicit
//! `allowOutsideWorkingDirectory` flag and a non-traversable absolute
//! path. A path `p` is inside a directory `d` iff `relative(d, p)` does
//! not begin with `..` and is not absolute.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use cv_domain::error::{Error, Result};

/// Compute the relative path from `base` to `target` lexically.
/// Both inputs must be absolute.
pub fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base: Vec<Component> = base.components().collect();
    let target_parts: Vec<Component> = target.components().collect();

    let common = base
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part);
    }
    rel
}

/// The containment rule: `relative(dir, path)` neither starts with `..`
/// nor is absolute.
pub fn is_inside(dir: &Path, path: &Path) -> bool {
    let rel = relative_path(dir, path);
    if rel.is_absolute() {
        return false;
    }
    !matches!(rel.components().next(), Some(Component::ParentDir))
}

/// Resolve symlinks on the longest existing prefix, then re-append the
/// missing tail. Lets not-yet-created files resolve through the real
/// location of their parent directory.
fn resolve_existing_prefix(candidate: &Path) -> Result<PathBuf> {
    if candidate.exists() {
        return candidate.canonicalize().map_err(Error::Io);
    }

    let mut existing = candidate;
    let mut tail: Vec<&OsStr> = Vec::new();
    loop {
        if existing.exists() {
            break;
        }
        match existing.parent() {
            Some(parent) => {
                if let Some(name) = existing.file_name() {
                    tail.push(name);
                }
                existing = parent;
            }
            None => break,
        }
    }

    let mut resolved = existing.canonicalize().map_err(Error::Io)?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}

/// Per-call filesystem sandbox: the conversation working directory plus
/// the calling agent's home.
#[derive(Debug, Clone)]
pub struct Sandbox {
    working_dir: PathBuf,
    home_dir: PathBuf,
}

impl Sandbox {
    pub fn new(working_dir: impl Into<PathBuf>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            home_dir: home_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Resolve a requested path against the sandbox.
    ///
    /// Relative paths land in the working directory. Home is always
    /// allowed, but a symlink that points out of home is rejected.
    /// Everything outside home and working directory needs
    /// `allow_outside` and an absolute request.
    pub fn resolve(&self, requested: &str, allow_outside: bool) -> Result<PathBuf> {
        let requested_path = Path::new(requested);
        let candidate = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            self.working_dir.join(requested_path)
        };

        let canonical_home = resolve_existing_prefix(&self.home_dir)?;
        let canonical_work = resolve_existing_prefix(&self.working_dir)?;
        let resolved = resolve_existing_prefix(&candidate)?;

        if is_inside(&canonical_home, &resolved) {
            return Ok(resolved);
        }

        // Lexically inside home but resolving elsewhere means a symlink
        // points out of home.
        if is_inside(&self.home_dir, &candidate) {
            return Err(Error::ScopeViolation(format!(
                "'{requested}' escapes the agent home via a symlink"
            )));
        }

        if is_inside(&canonical_work, &resolved) {
            return Ok(resolved);
        }

        if allow_outside && requested_path.is_absolute() {
            return Ok(resolved);
        }

        Err(Error::ScopeViolation(format!(
            "'{requested}' is outside the working directory; \
             pass allowOutsideWorkingDirectory=true with an absolute path to override"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_basics() {
        assert_eq!(
            relative_path(Path::new("/a/b"), Path::new("/a/b/c")),
            PathBuf::from("c")
        );
        assert_eq!(
            relative_path(Path::new("/a/b"), Path::new("/a/x")),
            PathBuf::from("../x")
        );
        assert_eq!(
            relative_path(Path::new("/a"), Path::new("/a")),
            PathBuf::new()
        );
    }

    #[test]
    fn is_inside_rule() {
        assert!(is_inside(Path::new("/w"), Path::new("/w/file.txt")));
        assert!(is_inside(Path::new("/w"), Path::new("/w")));
        assert!(!is_inside(Path::new("/w"), Path::new("/etc/passwd")));
        assert!(!is_inside(Path::new("/w"), Path::new("/wider/file")));
    }

    fn sandbox() -> (tempfile::TempDir, Sandbox) {
        let root = tempfile::TempDir::new().unwrap();
        let work = root.path().join("work");
        let home = root.path().join("home");
        std::fs::create_dir_all(&work).unwrap();
        std::fs::create_dir_all(&home).unwrap();
        let sandbox = Sandbox::new(&work, &home);
        (root, sandbox)
    }

    #[test]
    fn relative_paths_land_in_working_dir() {
        let (_root, sandbox) = sandbox();
        let resolved = sandbox.resolve("notes/today.md", false).unwrap();
        assert!(resolved.ends_with("work/notes/today.md"));
    }

    #[test]
    fn traversal_out_of_working_dir_is_rejected() {
        let (_root, sandbox) = sandbox();
        let err = sandbox.resolve("../secrets.txt", false).unwrap_err();
        assert!(matches!(err, Error::ScopeViolation(_)));
    }

    #[test]
    fn home_is_always_writable() {
        let (_root, sandbox) = sandbox();
        let inside = sandbox.home_dir().join("memo.md");
        let resolved = sandbox
            .resolve(inside.to_str().unwrap(), false)
            .unwrap();
        assert!(resolved.ends_with("home/memo.md"));
    }

    #[test]
    fn outside_requires_flag_and_absolute_path() {
        let (root, sandbox) = sandbox();
        let elsewhere = root.path().join("elsewhere.txt");
        let as_str = elsewhere.to_str().unwrap();

        assert!(sandbox.resolve(as_str, false).is_err());
        assert!(sandbox.resolve(as_str, true).is_ok());
        // The flag alone does not whitelist relative traversal.
        assert!(sandbox.resolve("../elsewhere.txt", true).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_home_is_rejected() {
        let (root, sandbox) = sandbox();
        let outside = root.path().join("target.txt");
        std::fs::write(&outside, "x").unwrap();
        let link = sandbox.home_dir().join("sneaky.txt");
        std::os::unix::fs::symlink(&outside, &link).unwrap();

        let err = sandbox
            .resolve(link.to_str().unwrap(), false)
            .unwrap_err();
        assert!(matches!(err, Error::ScopeViolation(_)));
    }
}
