//! The stable key under which a document's chunks live in the vector store.
//!
//! A `SourceId` is stable across reruns for the same logical source: the
//! same URL always maps to the same string, the same file always maps to
//! the same repo-relative path, and the same stdin content always maps to
//! the same content-derived id.

use std::path::Path;

use blake2::{Blake2b512, Digest};
use sha2::Sha256;

/// Tagged key identifying the logical document a chunk belongs to.
///
/// `Display` renders the form stored in `payload.url` (see `spec.md` §3);
/// there is deliberately no blanket `From<String>` impl — callers must
/// pick the right constructor so the derivation rules below are always
/// applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceId {
    /// An absolute HTTP(S) URL, for crawled/scraped pages.
    Url(String),
    /// `<repoName>/<relPath>` (or the `external/` fallback below).
    File(String),
    /// `<repoName>/stdin/<16-hex digest>`.
    Stdin(String),
}

impl SourceId {
    pub fn from_url(url: impl Into<String>) -> Self {
        SourceId::Url(url.into())
    }

    /// Derive a `SourceId` for a local file.
    ///
    /// `absolute_path` must already be canonicalized by the caller.
    /// Walks upward from the file's parent directory looking for a `.git`
    /// directory; the first one found becomes the repo root, and its
    /// directory name becomes `repoName`. If no `.git` root is found, the
    /// id falls back to `<repoName>/external/<basename>-<12 hex digest of
    /// the absolute path>`, where `repoName` is the name of the nearest
    /// ancestor that does exist (or `"external"` itself if the path has
    /// no meaningful parent).
    pub fn from_file_path(absolute_path: &Path) -> Self {
        if let Some((repo_root, repo_name)) = find_vcs_root(absolute_path) {
            if let Ok(rel) = absolute_path.strip_prefix(&repo_root) {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                return SourceId::File(format!("{repo_name}/{rel_str}"));
            }
        }

        let basename = absolute_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        let repo_name = absolute_path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "external".to_string());
        let digest = hex_prefix::<Sha256>(absolute_path.to_string_lossy().as_bytes(), 12);
        SourceId::File(format!("{repo_name}/external/{basename}-{digest}"))
    }

    /// Derive a `SourceId` for stdin content, deterministic per content.
    ///
    /// `repo_name` is the name of the nearest enclosing VCS root of `cwd`,
    /// or `"external"` if none is found.
    pub fn from_stdin(content: &[u8], cwd: &Path) -> Self {
        let repo_name = find_vcs_root(cwd)
            .map(|(_, name)| name)
            .unwrap_or_else(|| "external".to_string());
        let digest = hex_prefix::<Blake2b512>(content, 16);
        SourceId::Stdin(format!("{repo_name}/stdin/{digest}"))
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceId::Url(u) => write!(f, "{u}"),
            SourceId::File(p) => write!(f, "{p}"),
            SourceId::Stdin(p) => write!(f, "{p}"),
        }
    }
}

/// Walk upward from `start` looking for a `.git` directory. Returns the
/// repo root path and its directory name.
fn find_vcs_root(start: &Path) -> Option<(std::path::PathBuf, String)> {
    let mut dir = if start.is_dir() {
        Some(start.to_path_buf())
    } else {
        start.parent().map(|p| p.to_path_buf())
    };

    while let Some(d) = dir {
        if d.join(".git").exists() {
            let name = d
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "repo".to_string());
            return Some((d, name));
        }
        dir = d.parent().map(|p| p.to_path_buf());
    }
    None
}

fn hex_prefix<D: Digest>(data: &[u8], hex_len: usize) -> String {
    let mut hasher = D::new();
    hasher.update(data);
    let full = format!("{:x}", hasher.finalize());
    full.chars().take(hex_len).collect()
}
