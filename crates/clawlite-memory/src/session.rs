use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use clawlite_core::{ChatMessage, ClawLiteError, Result, SessionId};

/// Append-only JSONL session storage.
///
/// Each session is persisted in its own file:
/// `<state>/sessions/<session-id>.jsonl`, one JSON object per line, in
/// append order. The file is only ever appended to; readers take a
/// point-in-time snapshot by reading the whole file.
///
/// Writes go through [`SessionStore::append_batch`], which syncs once per
/// batch rather than per message — bounded loss, no per-line fsync latency.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(format!("{}.jsonl", session_id.file_stem()))
    }

    /// Append a single message (a batch of one).
    pub fn append(&self, session_id: &SessionId, message: &ChatMessage) -> Result<()> {
        self.append_batch(session_id, std::slice::from_ref(message))
    }

    /// Append a batch of messages and sync the file once.
    pub fn append_batch(&self, session_id: &SessionId, messages: &[ChatMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = self.path(session_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        for message in messages {
            let line = serde_json::to_string(message)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_data()?;
        Ok(())
    }

    /// Read the last `limit` messages in append order.
    pub fn read_last(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ChatMessage>> {
        let mut rows = self.read_all(session_id)?;
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        Ok(rows)
    }

    /// Full scan of a session log. Unparseable lines are skipped, not
    /// fatal — a torn tail write must not poison the whole session.
    pub fn read_all(&self, session_id: &SessionId) -> Result<Vec<ChatMessage>> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(vec![]);
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut rows = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(line) {
                Ok(msg) => rows.push(msg),
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "skipping corrupt session log line")
                }
            }
        }
        Ok(rows)
    }

    /// Byte length of the log file, 0 when absent. Used to assert the
    /// append-only property.
    pub fn log_len(&self, session_id: &SessionId) -> u64 {
        std::fs::metadata(self.path(session_id))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// List known session ids (by file stem).
    pub fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "jsonl") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Delete a session log. Returns false when it did not exist.
    pub fn delete(&self, session_id: &SessionId) -> Result<bool> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .map_err(|e| ClawLiteError::Session(format!("delete {}: {e}", path.display())))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawlite_core::Role;

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    #[test]
    fn append_then_read_last_n_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let id = sid("cli:demo");

        for i in 0..10 {
            store.append(&id, &ChatMessage::user(format!("m{i}"))).unwrap();
        }

        let last = store.read_last(&id, 3).unwrap();
        assert_eq!(last.len(), 3);
        assert_eq!(last[0].text, "m7");
        assert_eq!(last[2].text, "m9");
    }

    #[test]
    fn log_only_grows() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let id = sid("cli:grow");

        let mut previous = store.log_len(&id);
        for i in 0..5 {
            store.append(&id, &ChatMessage::assistant(format!("a{i}"))).unwrap();
            let now = store.log_len(&id);
            assert!(now > previous, "log must be strictly append-only");
            previous = now;
        }
    }

    #[test]
    fn corrupt_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let id = sid("cli:torn");

        store.append(&id, &ChatMessage::user("good")).unwrap();
        // Simulate a torn write at the tail
        let path = dir.path().join("cli:torn.jsonl");
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(b"{\"role\":\"user\",\"tex").unwrap();

        let rows = store.read_all(&id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "good");
    }

    #[test]
    fn tool_records_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let id = sid("cli:tools");

        let record = ChatMessage::tool("exec", serde_json::json!({"command": "ls"}), "exit=0");
        store.append(&id, &record).unwrap();

        let rows = store.read_all(&id).unwrap();
        assert_eq!(rows[0].role, Role::Tool);
        assert_eq!(rows[0].tool_name.as_deref(), Some("exec"));
        assert_eq!(rows[0].tool_result.as_deref(), Some("exit=0"));
    }

    #[test]
    fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        store.append(&sid("cli:a"), &ChatMessage::user("x")).unwrap();
        store.append(&sid("cli:b"), &ChatMessage::user("y")).unwrap();

        assert_eq!(store.list().unwrap(), vec!["cli:a", "cli:b"]);
        assert!(store.delete(&sid("cli:a")).unwrap());
        assert!(!store.delete(&sid("cli:a")).unwrap());
        assert_eq!(store.list().unwrap(), vec!["cli:b"]);
    }
}
