//! Lexical path handling for workspace containment checks.
//!
//! Nothing here touches the filesystem: paths are normalized purely by
//! their components so classification stays a function of step content.

use std::path::{Component, Path, PathBuf};

/// Resolve `.` and `..` components without consulting the filesystem.
///
/// `..` at the root is dropped (`/..` is `/`). Leading `..` on a relative
/// path is kept so an escape stays visible to the caller.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    let mut normalized = PathBuf::new();
    for component in out {
        normalized.push(component.as_os_str());
    }
    normalized
}

/// Windows drive paths (`C:\x`, `d:/y`) are never inside a POSIX workspace.
pub fn is_drive_path(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Resolve a raw path token against `root`.
///
/// Absolute paths starting with one of `aliases` (the in-sandbox mount point)
/// are rebased onto `root` first. Relative paths are joined onto `root`.
pub fn resolve_in_root(root: &Path, raw: &str, aliases: &[PathBuf]) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        for alias in aliases {
            if let Ok(rest) = candidate.strip_prefix(alias) {
                return normalize_lexically(&root.join(rest));
            }
        }
        return normalize_lexically(candidate);
    }
    normalize_lexically(&root.join(candidate))
}

/// True when `path` (already normalized) lies at or below `root`.
pub fn is_within(root: &Path, path: &Path) -> bool {
    let root = normalize_lexically(root);
    path.starts_with(&root)
}
