//! Exclusion patterns
//!
//! Patterns are shell-style globs matched against the final path component
//! only, so `node_modules` prunes every directory of that name anywhere in a
//! tree.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::ffi::OsStr;
use std::path::Path;
use tracing::warn;

/// Compiled set of base-name exclusion patterns
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    patterns: Vec<String>,
    set: GlobSet,
}

impl Default for ExcludeMatcher {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            set: GlobSet::empty(),
        }
    }
}

impl ExcludeMatcher {
    /// Compile patterns; malformed ones are logged and ignored
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut builder = GlobSetBuilder::new();
        let mut accepted = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    accepted.push(pattern.to_string());
                }
                Err(e) => warn!("Ignoring invalid exclude pattern {:?}: {}", pattern, e),
            }
        }

        match builder.build() {
            Ok(set) => Self {
                patterns: accepted,
                set,
            },
            Err(e) => {
                warn!("Failed to compile exclude patterns: {}", e);
                Self::default()
            }
        }
    }

    /// First pattern matching `name`, if any
    pub fn matching_pattern(&self, name: &str) -> Option<&str> {
        self.set
            .matches(name)
            .into_iter()
            .min()
            .and_then(|index| self.patterns.get(index))
            .map(String::as_str)
    }

    pub fn is_excluded_name(&self, name: &OsStr) -> bool {
        self.set.is_match(Path::new(name))
    }

    /// Match the final component of `path`
    pub fn is_excluded(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| self.is_excluded_name(name))
            .unwrap_or(false)
    }
}
