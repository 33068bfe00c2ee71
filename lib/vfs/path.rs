//! Slash-separated tree paths.
//!
//! Every [`VfsTree`](super::VfsTree) node is keyed by its canonical path: a leading `/`, no
//! trailing slash (except the root itself), no empty or `.` components. `..` pops the previous
//! component and never escapes the root.

/// The root path. Always present in a tree and never removable.
pub const ROOT: &str = "/";

/// Canonicalize `path`.
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return ROOT.to_owned();
    }
    let mut out = String::with_capacity(path.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Append `name` to an already-canonical `parent`.
#[must_use]
pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        normalize(&format!("/{name}"))
    } else {
        normalize(&format!("{parent}/{name}"))
    }
}

/// Parent of a canonical path, or `None` for the root.
#[must_use]
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => Some(ROOT),
    }
}

/// Last component of a canonical path. Empty for the root.
#[must_use]
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or_default()
}

/// Components of a canonical path, root excluded.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Whether `path` equals `ancestor` or lies beneath it.
#[must_use]
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT || path == ancestor {
        return true;
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}
