//! Lexical path helpers.

use std::path::{Component, Path, PathBuf};

/// Resolve `path` against `root` and normalize it lexically.
///
/// `.` components are dropped and `..` pops the previous component. The
/// filesystem is not consulted, so the path does not need to exist.
pub fn normalize(root: &Path, path: &Path) -> PathBuf {
  let joined = if path.is_absolute() { path.to_path_buf() } else { root.join(path) };

  let mut out = PathBuf::new();
  for component in joined.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        out.pop();
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}

/// Display a path relative to `root` when it lives underneath it.
pub fn display_relative(root: &Path, path: &Path) -> String {
  match path.strip_prefix(root) {
    Ok(rel) if !rel.as_os_str().is_empty() => rel.display().to_string(),
    _ => path.display().to_string(),
  }
}
