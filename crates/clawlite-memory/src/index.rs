use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clawlite_core::{ClawLiteError, Result};

/// One long-term memory fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub text: String,
    pub source_tag: String,
    pub created_at: DateTime<Utc>,
}

/// Tokens too common to carry retrieval signal.
const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "his", "i", "in", "is", "it", "its", "me", "my", "of", "on", "or", "she", "so", "that",
    "the", "their", "them", "they", "this", "to", "was", "we", "were", "what", "when", "which",
    "who", "will", "with", "you", "your",
];

const CONSOLIDATION_DEBOUNCE: Duration = Duration::from_secs(60);

/// Long-term memory: an append-mostly JSONL file plus a deliberately simple
/// lexical retrieval function. Overlap = number of distinct query tokens
/// appearing in the candidate after stop-word filtering and case folding;
/// ties break toward recency. No vector index in the core.
pub struct MemoryIndex {
    path: PathBuf,
    /// Session tags with an in-flight or just-finished consolidation.
    debounce: Mutex<HashMap<String, Instant>>,
}

impl MemoryIndex {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::write(&path, "")?;
        }
        Ok(Self {
            path,
            debounce: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tokens(text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut current = String::new();
        for c in text.chars() {
            if c.is_alphanumeric() || c == '_' {
                current.extend(c.to_lowercase());
            } else if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            out.push(current);
        }
        out.retain(|t| !STOP_WORDS.contains(&t.as_str()));
        out
    }

    /// Append a memory entry.
    pub fn add(&self, text: &str, source_tag: &str) -> Result<MemoryEntry> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClawLiteError::Memory("memory text must not be empty".into()));
        }
        let entry = MemoryEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            text: text.to_string(),
            source_tag: source_tag.to_string(),
            created_at: Utc::now(),
        };
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        file.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_data()?;
        Ok(entry)
    }

    /// Full scan of the index. Bad lines are skipped.
    pub fn all(&self) -> Result<Vec<MemoryEntry>> {
        let raw = std::fs::read_to_string(&self.path)?;
        let mut out = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<MemoryEntry>(line) {
                if !entry.text.is_empty() {
                    out.push(entry);
                }
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> usize {
        self.all().map(|v| v.len()).unwrap_or(0)
    }

    /// Top-K entries by lexical overlap with the query. Zero-overlap
    /// candidates are never returned.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let records = self.all()?;
        if records.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let query_tokens: std::collections::HashSet<String> =
            Self::tokens(query).into_iter().collect();
        if query_tokens.is_empty() {
            return Ok(vec![]);
        }

        let mut scored: Vec<(usize, &MemoryEntry)> = records
            .iter()
            .map(|entry| {
                let candidate: std::collections::HashSet<String> =
                    Self::tokens(&entry.text).into_iter().collect();
                let overlap = query_tokens.intersection(&candidate).count();
                (overlap, entry)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        // Overlap descending, recency breaks ties.
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.created_at.cmp(&a.1.created_at)));
        Ok(scored.into_iter().take(limit).map(|(_, e)| e.clone()).collect())
    }

    /// Claim the consolidation slot for a tag. Returns false when a
    /// consolidation for the same tag ran within the debounce window, so
    /// duplicate triggers do not emit duplicate summaries.
    pub fn begin_consolidation(&self, tag: &str) -> bool {
        let mut debounce = self.debounce.lock();
        let now = Instant::now();
        debounce.retain(|_, at| now.duration_since(*at) <= CONSOLIDATION_DEBOUNCE);
        if debounce.contains_key(tag) {
            return false;
        }
        debounce.insert(tag.to_string(), now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> MemoryIndex {
        MemoryIndex::open(dir.path().join("memory.jsonl")).unwrap()
    }

    #[test]
    fn add_and_search_by_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir);

        index.add("The operator prefers dark roast coffee", "user").unwrap();
        index.add("Deploy target is a hetzner box in falkenstein", "ops").unwrap();
        index.add("Coffee machine descaling is due in march", "home").unwrap();

        let hits = index.search("where do we deploy", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("hetzner"));

        let hits = index.search("coffee", 5).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn search_is_case_folded_and_stop_word_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir);
        index.add("Birthday of the operator: June 12", "user").unwrap();

        // "the"/"of" carry no signal; "BIRTHDAY" matches case-insensitively
        let hits = index.search("the BIRTHDAY of", 5).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn zero_overlap_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir);
        index.add("kubernetes cluster credentials rotated", "ops").unwrap();
        assert!(index.search("banana smoothie", 5).unwrap().is_empty());
    }

    #[test]
    fn recency_breaks_ties() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir);
        index.add("favorite color blue", "a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        index.add("favorite color green", "b").unwrap();

        let hits = index.search("favorite color", 1).unwrap();
        assert_eq!(hits[0].source_tag, "b");
    }

    #[test]
    fn consolidation_debounce_drops_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let index = open(&dir);
        assert!(index.begin_consolidation("session:cli:demo"));
        assert!(!index.begin_consolidation("session:cli:demo"));
        // Different tag is unaffected
        assert!(index.begin_consolidation("session:cli:other"));
    }

    #[test]
    fn entries_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = open(&dir);
            index.add("persisted fact", "test").unwrap();
        }
        let index = open(&dir);
        assert_eq!(index.count(), 1);
    }
}
