//! Ordered reversed-label suffix index. Grounded on
//! `original_source/service/src/domain_matcher.py`: reversing once lets a
//! sorted array + binary search answer suffix queries in O(log n) without
//! a trie.

/// Reverses a domain string, matching Python's `s[::-1]` byte-for-byte
/// (domains are ASCII/IDNA-encoded by the time they reach this matcher).
fn reversed(domain: &str) -> String {
    domain.chars().rev().collect()
}

#[derive(Debug, Default, Clone)]
pub struct SuffixMatcher {
    /// Reversed suffixes, kept strictly sorted and deduplicated.
    prefixes: Vec<String>,
}

impl SuffixMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole contents. Empty input yields an empty matcher.
    pub fn update<I, S>(&mut self, suffixes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut prefixes: Vec<String> = suffixes
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .filter(|s| !s.is_empty())
            .map(|s| reversed(&s))
            .collect();
        prefixes.sort();
        prefixes.dedup();
        self.prefixes = prefixes;
    }

    /// True iff `domain` equals, or is a dotted sub-label of, any suffix
    /// in this matcher (spec.md §8 invariant 1). The predecessor of
    /// `reverse(domain)` in the sorted reversed-suffix array is found by
    /// binary search in O(log n); a boundary check (`.` right after the
    /// shared prefix, or an exact-length match) then rejects
    /// look-alikes such as "notexample.com" against the suffix
    /// "example.com" that a plain prefix test would wrongly accept.
    pub fn matches(&self, domain: &str) -> bool {
        let rev = reversed(domain);
        let idx = match self.prefixes.binary_search(&rev) {
            Ok(_) => return true,
            Err(idx) => idx,
        };
        if idx == 0 {
            return false;
        }
        let candidate = self.prefixes[idx - 1].as_str();
        rev.starts_with(candidate) && rev.as_bytes().get(candidate.len()) == Some(&b'.')
    }

    /// Idempotent insert; no-op if already present.
    pub fn add(&mut self, domain: &str) {
        if domain.is_empty() {
            return;
        }
        let rev = reversed(domain);
        match self.prefixes.binary_search(&rev) {
            Ok(_) => {}
            Err(idx) => self.prefixes.insert(idx, rev),
        }
    }

    /// No-op if `domain` isn't present.
    pub fn remove(&mut self, domain: &str) {
        let rev = reversed(domain);
        if let Ok(idx) = self.prefixes.binary_search(&rev) {
            self.prefixes.remove(idx);
        }
    }

    /// Un-reversed, strictly sorted, deduplicated set.
    pub fn get_all(&self) -> Vec<String> {
        let mut out: Vec<String> = self.prefixes.iter().map(|p| reversed(p)).collect();
        out.sort();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}
