//! Which paths of the data directory never enter a commit.
//!
//! The document store keeps transaction scratch space, a lock file and its
//! own settings next to the entities. [`IgnorePolicy`] excludes those (plus
//! any configured extras) both through a `.gitignore` written at bootstrap
//! and through the staging callback every commit goes through.

use std::path::Path;

use tracing::debug;

/// Patterns excluded from every commit.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[".tran/**", "fs.lock", "settings", "storage/**", "*.tmp"];

/// Name of the ignore file written into the data directory.
pub const GITIGNORE: &str = ".gitignore";

/// Glob-based path exclusion.
#[derive(Debug, Clone)]
pub struct IgnorePolicy {
    patterns: Vec<String>,
}

impl Default for IgnorePolicy {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl IgnorePolicy {
    /// The built-in patterns followed by `extra`.
    pub fn new(extra: Vec<String>) -> Self {
        let mut patterns: Vec<String> = DEFAULT_IGNORE_PATTERNS.iter().map(|p| p.to_string()).collect();
        for pattern in extra {
            if !patterns.contains(&pattern) {
                patterns.push(pattern);
            }
        }
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `rel_path` (forward- or back-slash separated) is excluded.
    ///
    /// A path is excluded when it, or any of its parent directories, matches
    /// a pattern; `.tran/**` therefore also covers `.tran` itself.
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let path = rel_path.replace('\\', "/");
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return false;
        }
        if path == ".git" || path.starts_with(".git/") {
            return true;
        }

        let mut prefix = String::new();
        for segment in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);
            if let Some(pattern) = self.matching_pattern(&prefix, segment) {
                debug!(path, pattern, "path matches ignore pattern");
                return true;
            }
        }
        false
    }

    /// Patterns are anchored at the data directory root, except slash-free
    /// wildcard patterns such as `*.tmp`, which match a name at any depth.
    fn matching_pattern(&self, prefix: &str, segment: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| {
                if pattern.starts_with('*') && !pattern.contains('/') {
                    return glob_match::glob_match(pattern, segment);
                }
                glob_match::glob_match(pattern, prefix)
                    || pattern
                        .strip_suffix("/**")
                        .is_some_and(|dir| glob_match::glob_match(dir, prefix))
            })
            .map(String::as_str)
    }

    /// `.gitignore` contents equivalent to this policy.
    pub fn gitignore_contents(&self) -> String {
        let mut out = String::from("# managed by storesync\n");
        for pattern in &self.patterns {
            // Anchor to the data directory root like the glob matcher does.
            let line = match pattern.strip_suffix("/**") {
                Some(dir) => format!("/{dir}/"),
                None if pattern.contains('/') => format!("/{pattern}"),
                None if pattern.starts_with('*') => pattern.clone(),
                None => format!("/{pattern}"),
            };
            out.push_str(&line);
            out.push('\n');
        }
        out
    }

    /// Write `.gitignore` into `dir` unless one already exists.
    ///
    /// Returns whether a file was written.
    pub fn write_gitignore(&self, dir: &Path) -> std::io::Result<bool> {
        let path = dir.join(GITIGNORE);
        if path.exists() {
            debug!(path = %path.display(), "keeping existing .gitignore");
            return Ok(false);
        }
        std::fs::write(&path, self.gitignore_contents())?;
        Ok(true)
    }
}
