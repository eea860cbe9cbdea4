//! Virtual path helpers.
//!
//! Virtual paths are absolute, `/`-separated, with no `.`/`..` segments and no
//! trailing slash (except the root itself). Every public entry point in the
//! placement layer normalizes before touching the registry, so downstream code
//! can compare prefixes component-wise without re-parsing.

/// Normalize a raw path into canonical virtual form.
///
/// Relative input is treated as rooted at `/`. `.` segments are dropped and
/// `..` pops one component (never above the root).
pub fn normalize(raw: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    if out.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", out.join("/"))
    }
}

/// Path components, root excluded. `components("/")` is empty.
pub fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Number of leading components shared by two normalized paths.
/// The root component itself never counts.
pub fn shared_components(a: &str, b: &str) -> usize {
    components(a)
        .iter()
        .zip(components(b).iter())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Parent of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Final component of a normalized path; empty for the root.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Volume-relative path for `vpath` under `mount_prefix`.
///
/// The caller guarantees `vpath` resolved under `mount_prefix`; the result is
/// always `/`-rooted (the prefix `/a` maps `/a/b/c` to `/b/c` and `/a` itself
/// to `/`).
pub fn rel_path(mount_prefix: &str, vpath: &str) -> String {
    if mount_prefix == "/" {
        return vpath.to_string();
    }
    let rest = vpath.strip_prefix(mount_prefix).unwrap_or(vpath);
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}
