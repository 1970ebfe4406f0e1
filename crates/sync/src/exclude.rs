use crate::error::SyncError;

/// Glob patterns that keep paths out of a sync.
///
/// A path is excluded when a pattern matches the whole relative path, any
/// trailing part of it that starts at a `/`, or any single segment. So
/// `*.pyc`, `.git` and `__pycache__/*` all work at every depth.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<glob::Pattern>,
}

impl ExcludeSet {
    /// Compiles `patterns`; an invalid one is a configuration error.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, SyncError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p.as_ref()).map_err(|e| {
                    SyncError::InvalidConfiguration(format!(
                        "invalid exclude pattern {:?}: {e}",
                        p.as_ref()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `rel_path` (`/`-separated) is excluded.
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let tails = std::iter::once(rel_path).chain(
            rel_path
                .match_indices('/')
                .map(|(i, _)| &rel_path[i + 1..]),
        );
        let segments = rel_path.split('/');
        tails
            .chain(segments)
            .filter(|candidate| !candidate.is_empty())
            .any(|candidate| self.patterns.iter().any(|p| p.matches(candidate)))
    }
}
