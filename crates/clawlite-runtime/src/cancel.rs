use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use clawlite_core::SessionId;

struct Inner {
    /// Live handles per session: (handle id, resolver).
    handles: HashMap<String, Vec<(u64, watch::Sender<bool>)>>,
    /// Parent session → spawned child sessions, so `/stop` cascades.
    children: HashMap<String, Vec<String>>,
    next_id: u64,
}

/// Per-session cancellation handles. Cheap to clone — all clones share the
/// same handle table.
///
/// Every engine run registers a handle keyed by its session id; subagent
/// spawns link their child session under the parent. Cancelling a session
/// resolves every handle of that session and of all descendants.
#[derive(Clone)]
pub struct CancelRegistry {
    inner: Arc<Mutex<Inner>>,
}

/// Awaitable cancellation signal for one run.
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when the session is cancelled.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Removes the handle on drop so completed runs do not pile up.
pub struct CancelGuard {
    registry: CancelRegistry,
    session: String,
    id: u64,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        let mut inner = self.registry.inner.lock();
        if let Some(handles) = inner.handles.get_mut(&self.session) {
            handles.retain(|(id, _)| *id != self.id);
            if handles.is_empty() {
                inner.handles.remove(&self.session);
            }
        }
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                handles: HashMap::new(),
                children: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Register a new run handle for a session.
    pub fn register(&self, session_id: &SessionId) -> (CancelGuard, CancelToken) {
        let (tx, rx) = watch::channel(false);
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .handles
            .entry(session_id.to_string())
            .or_default()
            .push((id, tx));
        (
            CancelGuard {
                registry: self.clone(),
                session: session_id.to_string(),
                id,
            },
            CancelToken { rx },
        )
    }

    /// Record that `child` was spawned from `parent`.
    pub fn link_child(&self, parent: &SessionId, child: &SessionId) {
        self.inner
            .lock()
            .children
            .entry(parent.to_string())
            .or_default()
            .push(child.to_string());
    }

    /// Resolve all handles for a session and its descendants. Returns how
    /// many handles were resolved.
    pub fn cancel_session(&self, session_id: &SessionId) -> usize {
        let mut inner = self.inner.lock();

        // Walk the spawn tree
        let mut targets = vec![session_id.to_string()];
        let mut i = 0;
        while i < targets.len() {
            if let Some(kids) = inner.children.remove(&targets[i]) {
                targets.extend(kids);
            }
            i += 1;
        }

        let mut resolved = 0;
        for target in &targets {
            if let Some(handles) = inner.handles.remove(target) {
                for (_, tx) in handles {
                    let _ = tx.send(true);
                    resolved += 1;
                }
            }
        }
        resolved
    }

    /// Number of live handles for a session (tests/diagnostics).
    pub fn active_count(&self, session_id: &SessionId) -> usize {
        self.inner
            .lock()
            .handles
            .get(session_id.as_str())
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn cancel_resolves_registered_tokens() {
        let registry = CancelRegistry::new();
        let (_guard, mut token) = registry.register(&sid("telegram:42"));
        assert!(!token.is_cancelled());

        assert_eq!(registry.cancel_session(&sid("telegram:42")), 1);
        token.cancelled().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_cascades_to_descendants() {
        let registry = CancelRegistry::new();
        let parent = sid("telegram:42");
        let child = sid("sub:abc");
        let grandchild = sid("sub:def");

        registry.link_child(&parent, &child);
        registry.link_child(&child, &grandchild);

        let (_g1, mut t1) = registry.register(&parent);
        let (_g2, mut t2) = registry.register(&child);
        let (_g3, mut t3) = registry.register(&grandchild);

        assert_eq!(registry.cancel_session(&parent), 3);
        t1.cancelled().await;
        t2.cancelled().await;
        t3.cancelled().await;
    }

    #[test]
    fn guard_drop_unregisters() {
        let registry = CancelRegistry::new();
        let session = sid("cli:demo");
        {
            let (_guard, _token) = registry.register(&session);
            assert_eq!(registry.active_count(&session), 1);
        }
        assert_eq!(registry.active_count(&session), 0);
    }

    #[test]
    fn cancel_other_session_is_a_noop() {
        let registry = CancelRegistry::new();
        let (_guard, token) = registry.register(&sid("telegram:1"));
        assert_eq!(registry.cancel_session(&sid("telegram:2")), 0);
        assert!(!token.is_cancelled());
    }
}
