//! A [`SuffixMatcher`] bound to a text file. Grounded on
//! `original_source/service/src/domain_matchers.py`'s
//! `SerializableDomainMatcher`.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::suffix::SuffixMatcher;

#[derive(Debug)]
pub struct PersistentMatcher {
    matcher: SuffixMatcher,
    path: PathBuf,
    dirty: bool,
}

impl PersistentMatcher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            matcher: SuffixMatcher::new(),
            path,
            dirty: false,
        }
    }

    /// Reads non-empty stripped lines from the backing file. If the file
    /// doesn't exist, creates an empty one and proceeds with an empty
    /// matcher, per spec.md §4.2.
    pub async fn load(&mut self) -> anyhow::Result<()> {
        if !self.path.exists() {
            tokio::fs::write(&self.path, b"").await?;
            self.matcher.update(Vec::<String>::new());
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(&self.path).await?;
        let lines: Vec<String> = raw
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        self.matcher.update(lines);
        Ok(())
    }

    /// Atomically replaces the file with sorted un-reversed entries,
    /// joined by newlines, via write-then-rename (spec.md §9's crash
    /// safety recommendation over the Python original's plain
    /// truncate-write).
    pub async fn dump(&mut self) -> anyhow::Result<()> {
        let all = self.matcher.get_all();
        let contents = all.join("\n");

        let tmp_path = tmp_path_for(&self.path);
        let result: anyhow::Result<()> = async {
            tokio::fs::write(&tmp_path, contents.as_bytes()).await?;
            tokio::fs::rename(&tmp_path, &self.path).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                self.dirty = true;
                warn!("failed to dump domain list {:?}: {}", self.path, e);
                Err(e)
            }
        }
    }

    pub fn update<I, S>(&mut self, suffixes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.matcher.update(suffixes);
        self.dirty = true;
    }

    pub fn add(&mut self, domain: &str) {
        self.matcher.add(domain);
        self.dirty = true;
    }

    pub fn remove(&mut self, domain: &str) {
        self.matcher.remove(domain);
        self.dirty = true;
    }

    pub fn matches(&self, domain: &str) -> bool {
        self.matcher.matches(domain)
    }

    pub fn get_all(&self) -> Vec<String> {
        self.matcher.get_all()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
