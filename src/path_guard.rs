//! Lexical confinement of client-supplied paths to a repository root.
//!
//! Nothing in this module touches the filesystem. A path is accepted only
//! when both layers agree:
//! - the raw input is relative and has no `..` segment
//! - the normalized join of root and input is still a descendant of the
//!   normalized root

use serde::Serialize;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Why a path was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathRejection {
    /// A `..` segment, or a join that resolves outside the root.
    Traversal,
    /// Input began with a separator or carried a root/prefix.
    AbsolutePath,
    /// Input cannot name a file at all (embedded NUL).
    Unresolvable,
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathRejection::Traversal => write!(f, "path escapes the repository"),
            PathRejection::AbsolutePath => write!(f, "absolute paths are not allowed"),
            PathRejection::Unresolvable => write!(f, "path cannot be resolved"),
        }
    }
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathResolution {
    Resolved(PathBuf),
    Rejected(PathRejection),
}

impl PathResolution {
    pub fn into_result(self) -> Result<PathBuf, PathRejection> {
        match self {
            PathResolution::Resolved(path) => Ok(path),
            PathResolution::Rejected(reason) => Err(reason),
        }
    }
}

/// Resolve `relative` against `root`, refusing anything that could leave it.
///
/// An empty input resolves to the root itself.
pub fn validate(relative: &str, root: &Path) -> PathResolution {
    if relative.contains('\0') {
        return PathResolution::Rejected(PathRejection::Unresolvable);
    }
    if relative.starts_with('/') || relative.starts_with('\\') {
        return PathResolution::Rejected(PathRejection::AbsolutePath);
    }
    if has_parent_segment(relative) {
        return PathResolution::Rejected(PathRejection::Traversal);
    }

    let candidate = Path::new(relative);
    if candidate.has_root() || candidate.is_absolute() {
        return PathResolution::Rejected(PathRejection::AbsolutePath);
    }
    if candidate
        .components()
        .any(|c| matches!(c, Component::Prefix(_)))
    {
        return PathResolution::Rejected(PathRejection::AbsolutePath);
    }

    let root = normalize(root);
    let resolved = normalize(&root.join(candidate));
    if resolved.starts_with(&root) {
        PathResolution::Resolved(resolved)
    } else {
        PathResolution::Rejected(PathRejection::Traversal)
    }
}

/// Forward-slash form of `path` relative to `root`, for listings and logs.
pub fn relative_display(root: &Path, path: &Path) -> String {
    let stripped = path.strip_prefix(normalize(root)).unwrap_or(path);
    stripped.to_string_lossy().replace('\\', "/")
}

fn has_parent_segment(raw: &str) -> bool {
    raw.split(['/', '\\']).any(|segment| segment == "..")
}

/// Resolve `.` and `..` without filesystem access; `..` never climbs above a root.
fn normalize(path: &Path) -> PathBuf {
    let mut components: Vec<Component<'_>> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(_) => components.push(component),
            Component::RootDir => {
                components.retain(|c| matches!(c, Component::Prefix(_)));
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => match components.last() {
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                Some(Component::Normal(_)) => {
                    components.pop();
                }
                _ => components.push(component),
            },
            Component::Normal(_) => components.push(component),
        }
    }

    if components.is_empty() {
        PathBuf::from(".")
    } else {
        components.iter().collect()
    }
}
