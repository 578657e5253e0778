use std::path::{Component, Path, PathBuf};

use tether_core::Result;

/// Resolve a path with symlinks dereferenced. Non-existent suffixes are
/// normalized lexically onto the canonicalized deepest existing ancestor, so
/// `root/../etc/passwd` resolves to `/etc/passwd` whether or not the target
/// exists yet.
pub fn resolve(path: &Path) -> Result<PathBuf> {
    let mut current = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match current.canonicalize() {
            Ok(resolved) => {
                let mut out = resolved;
                for comp in suffix.iter().rev() {
                    out.push(comp);
                }
                return Ok(normalize(&out));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                match (current.file_name(), current.parent()) {
                    (Some(name), Some(parent)) if !parent.as_os_str().is_empty() => {
                        suffix.push(name.to_os_string());
                        current = parent.to_path_buf();
                    }
                    _ => return Ok(normalize(path)),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// Lexical `.`/`..` removal for the non-existent suffix; symlinks cannot hide
// in components that do not exist on disk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
