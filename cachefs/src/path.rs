//! Mapping of caller-visible relative paths onto the source tree, the cache
//! tree and the flat tombstone namespace at the top of the cache root.
//!
//! A tombstone name is `RM_PREFIX` followed by the relative path with every
//! separator replaced by `SEPARATOR_TOKEN`, so `/a/b.txt` is marked by
//! `<cache>/.__cachefs_rm__a----b.txt` regardless of nesting depth.
//!
//! Relative paths that already contain `SEPARATOR_TOKEN` do not round-trip
//! through [`escape`]/[`unescape`]; such names are unsupported.

use std::path::{Path, PathBuf};

/// Prefix of every tombstone marker file under the cache root.
pub const RM_PREFIX: &str = ".__cachefs_rm__";

/// Stand-in for `/` inside a tombstone marker name.
pub const SEPARATOR_TOKEN: &str = "----";

/// Normalise a caller path to `/a/b` form: leading slash, no empty or `.`
/// components, no trailing slash. The root is `/`.
pub fn normalize(rel: &str) -> String {
    let parts: Vec<&str> = rel
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

/// Join a directory entry name onto a relative directory path.
pub fn join(dir: &str, name: &str) -> String {
    let dir = normalize(dir);
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Parent of a normalised relative path; `None` for the root.
pub fn parent(rel: &str) -> Option<String> {
    let rel = normalize(rel);
    if rel == "/" {
        return None;
    }
    match rel.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(n) => Some(rel[..n].to_string()),
        None => None,
    }
}

/// Escape a relative path into a single flat tombstone file name.
pub fn escape(rel: &str) -> String {
    let rel = normalize(rel);
    let body = rel.trim_start_matches('/').replace('/', SEPARATOR_TOKEN);
    format!("{RM_PREFIX}{body}")
}

/// Inverse of [`escape`]. Returns `None` if `name` is not a tombstone name.
pub fn unescape(name: &str) -> Option<String> {
    let body = name.strip_prefix(RM_PREFIX)?;
    Some(normalize(&body.replace(SEPARATOR_TOKEN, "/")))
}

/// Whether a directory entry name is a tombstone marker.
pub fn is_tombstone_name(name: &str) -> bool {
    name.starts_with(RM_PREFIX)
}

/// Whether any component of a relative path is a tombstone marker name.
pub fn touches_tombstone(rel: &str) -> bool {
    rel.split('/').any(is_tombstone_name)
}

/// Pure resolver from relative paths to absolute source, cache and
/// tombstone locations.
#[derive(Debug, Clone)]
pub struct PathResolver {
    source_root: PathBuf,
    cache_root: PathBuf,
}

impl PathResolver {
    pub fn new(source_root: impl Into<PathBuf>, cache_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            cache_root: cache_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn source_path(&self, rel: &str) -> PathBuf {
        Self::under(&self.source_root, rel)
    }

    pub fn cache_path(&self, rel: &str) -> PathBuf {
        Self::under(&self.cache_root, rel)
    }

    pub fn tombstone_path(&self, rel: &str) -> PathBuf {
        self.cache_root.join(escape(rel))
    }

    fn under(root: &Path, rel: &str) -> PathBuf {
        let rel = normalize(rel);
        let trimmed = rel.trim_start_matches('/');
        if trimmed.is_empty() {
            root.to_path_buf()
        } else {
            root.join(trimmed)
        }
    }
}
