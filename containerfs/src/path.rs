pub const SEPARATOR: char = '/';
pub const PARENT: &str = "..";

/// Where resolution of a path starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anchor {
    Root,
    Cwd,
}

pub fn is_absolute(path: &str) -> bool {
    path.starts_with(SEPARATOR)
}

/// Splits a path into its anchor and its non-empty segments. Repeated and
/// trailing separators produce no segments.
pub fn split(path: &str) -> (Anchor, Vec<&str>) {
    let anchor = if is_absolute(path) {
        Anchor::Root
    } else {
        Anchor::Cwd
    };
    let segments = path.split(SEPARATOR).filter(|s| !s.is_empty()).collect();
    (anchor, segments)
}

/// Spelling of the first `n` segments, keeping the leading separator of an
/// absolute path. Used to name the segment that failed to resolve.
pub fn prefix(anchor: Anchor, segments: &[&str], n: usize) -> String {
    let joined = segments[..n.min(segments.len())].join("/");
    match anchor {
        Anchor::Root => format!("/{}", joined),
        Anchor::Cwd => joined,
    }
}
