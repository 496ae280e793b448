//! Ignore patterns for tracked folders
//!
//! Patterns are matched against the `/`-separated relative path,
//! case-insensitively, with `*` matching any run of characters (including
//! `/`). Applied before diffing, so both peers agree on the tracked set.

/// Compiled ignore patterns for one folder.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<String>,
}

impl IgnoreRules {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let path = path.to_lowercase();
        self.patterns.iter().any(|p| wildcard_match(p, &path))
    }
}

fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    if !text.starts_with(parts[0]) {
        return false;
    }
    let mut pos = parts[0].len();

    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(found) => pos += found + part.len(),
            None => return false,
        }
    }

    let last = parts[parts.len() - 1];
    if last.is_empty() {
        return true;
    }
    text.len() - pos >= last.len() && text.ends_with(last)
}
