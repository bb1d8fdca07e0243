//! Glob matching against watch roots
//!
//! Patterns are tried against the absolute path and against the path
//! relative to each root, so `src/**/*.ts` and `**/node_modules/**` both work.

use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::Result;

/// Allow/ignore pattern pair bound to a set of roots
#[derive(Debug, Clone)]
pub struct PathMatcher {
    roots: Vec<PathBuf>,
    /// `None` allows everything
    allow: Option<GlobSet>,
    ignore: GlobSet,
}

impl PathMatcher {
    pub fn new<S: AsRef<str>>(roots: &[PathBuf], allow: &[S], ignore: &[S]) -> Result<Self> {
        let allow = if allow.is_empty() {
            None
        } else {
            Some(build_set(allow)?)
        };
        Ok(Self {
            roots: roots.to_vec(),
            allow,
            ignore: build_set(ignore)?,
        })
    }

    /// Whether an ignore pattern matches
    pub fn is_ignored(&self, path: &Path) -> bool {
        self.candidates(path).any(|p| self.ignore.is_match(p))
    }

    /// Whether an allow pattern matches; true when there are none
    pub fn is_allowed(&self, path: &Path) -> bool {
        match &self.allow {
            Some(allow) => self.candidates(path).any(|p| allow.is_match(p)),
            None => true,
        }
    }

    /// Allowed and not ignored
    pub fn matches(&self, path: &Path) -> bool {
        self.is_allowed(path) && !self.is_ignored(path)
    }

    /// Whether the path lies under one of the roots
    pub fn is_under_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn candidates<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = &'a Path> + 'a {
        std::iter::once(path).chain(
            self.roots
                .iter()
                .filter_map(move |root| path.strip_prefix(root).ok())
                .filter(|relative| !relative.as_os_str().is_empty()),
        )
    }
}

fn build_set<S: AsRef<str>>(patterns: &[S]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern.as_ref())?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(allow: &[&str], ignore: &[&str]) -> PathMatcher {
        PathMatcher::new(&[PathBuf::from("/proj")], allow, ignore).unwrap()
    }

    #[test]
    fn test_ignore_node_modules() {
        let m = matcher(&[], &["**/node_modules/**"]);
        assert!(m.is_ignored(Path::new("/proj/node_modules/react/index.js")));
        assert!(!m.is_ignored(Path::new("/proj/src/a.ts")));
        assert!(m.matches(Path::new("/proj/src/a.ts")));
    }

    #[test]
    fn test_relative_allow_patterns() {
        let m = matcher(&["src/**/*.ts"], &[]);
        assert!(m.is_allowed(Path::new("/proj/src/deep/a.ts")));
        assert!(!m.is_allowed(Path::new("/proj/README.md")));
        assert!(!m.is_allowed(Path::new("/other/src/a.js")));
    }

    #[test]
    fn test_root_membership() {
        let m = matcher(&[], &[]);
        assert!(m.is_under_root(Path::new("/proj/src/a.ts")));
        assert!(!m.is_under_root(Path::new("/project/a.ts")));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(PathMatcher::new(&[], &["a[b"], &[]).is_err());
    }
}
