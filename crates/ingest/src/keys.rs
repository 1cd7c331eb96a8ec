//! Canonical key rules.
//!
//! A key rule maps an archive entry name to the key shared by a metadata
//! file and its content file. Entries whose key cannot be derived are not
//! paired.

use crate::archive::base_name;

pub trait KeyRule: Send + Sync {
    fn derive(&self, entry_name: &str) -> Option<String>;
}

impl<F> KeyRule for F
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn derive(&self, entry_name: &str) -> Option<String> {
        self(entry_name)
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Everything before the first `.`, taken from either the full entry path
/// or only its last component.
#[derive(Debug, Clone, Copy)]
pub struct StemKey {
    full_path: bool,
}

impl StemKey {
    /// `2020/bmj.m123.xml` → `2020/bmj`
    pub fn full_path() -> Self {
        Self { full_path: true }
    }

    /// `2020/bmj.m123.xml` → `bmj`
    pub fn base_name() -> Self {
        Self { full_path: false }
    }
}

impl KeyRule for StemKey {
    fn derive(&self, entry_name: &str) -> Option<String> {
        let scope = if self.full_path {
            entry_name
        } else {
            base_name(entry_name)
        };
        non_empty(scope.split('.').next().unwrap_or(scope))
    }
}

/// First `width` characters of the entry's last path component.
#[derive(Debug, Clone, Copy)]
pub struct FixedWidthKey {
    pub width: usize,
}

impl KeyRule for FixedWidthKey {
    fn derive(&self, entry_name: &str) -> Option<String> {
        let base = base_name(entry_name);
        let end = base.char_indices().nth(self.width).map(|(i, _)| i);
        match end {
            Some(i) => non_empty(&base[..i]),
            None if base.chars().count() == self.width => non_empty(base),
            None => None,
        }
    }
}

/// One `/`-separated segment of the entry path, zero-based.
#[derive(Debug, Clone, Copy)]
pub struct PathSegmentKey {
    pub index: usize,
}

impl KeyRule for PathSegmentKey {
    fn derive(&self, entry_name: &str) -> Option<String> {
        entry_name.split('/').nth(self.index).and_then(non_empty)
    }
}

/// Page number inferred from the file name, normalized to five digits.
///
/// Starting at the first digit of the last path component and stopping at
/// the first `.`: keep the last six characters, drop `-`, drop one leading
/// `q`, strip leading zeros, then left-pad with zeros and keep the last
/// five. `pnas.201912345.xml` → `12345`, `q-0042.pdf` → `00042`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageKey;

impl KeyRule for PageKey {
    fn derive(&self, entry_name: &str) -> Option<String> {
        let base = base_name(entry_name);
        // Without any digit the whole name is the page.
        let from_digit = &base[base.find(|c: char| c.is_ascii_digit()).unwrap_or(0)..];
        let page = from_digit.split('.').next().unwrap_or(from_digit);
        if page.is_empty() || page == "xml" {
            return None;
        }

        let tail: String = {
            let chars: Vec<char> = page.chars().collect();
            chars[chars.len().saturating_sub(6)..].iter().collect()
        };
        let cleaned = tail.replace('-', "");
        let cleaned = cleaned.strip_prefix('q').unwrap_or(&cleaned);
        let trimmed = cleaned.trim_start_matches('0');

        let padded = format!("{trimmed:0>5}");
        let chars: Vec<char> = padded.chars().collect();
        Some(chars[chars.len() - 5..].iter().collect())
    }
}
