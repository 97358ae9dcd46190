//! Client registry: token → live session (spec §4.D).

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::session::ClientSession;

pub struct Registry {
    sessions: DashMap<String, Arc<ClientSession>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { sessions: DashMap::new() }
    }

    /// Registers `session` for `token`, closing (marking destroyed) any
    /// prior session for the same token.
    pub fn register(&self, token: &str, session: Arc<ClientSession>) {
        if let Some((_, old)) = self.sessions.remove(token) {
            old.mark_destroyed();
            info!(%token, "replaced existing session on re-register");
        }
        self.sessions.insert(token.to_string(), session);
    }

    /// Removes the entry for `token` iff the stored session is the same
    /// one the caller holds — prevents a late close from evicting a newer
    /// session registered in the meantime (spec §4.D, §5).
    pub fn deregister(&self, token: &str, session: &Arc<ClientSession>) {
        self.sessions.remove_if(token, |_, stored| Arc::ptr_eq(stored, session));
    }

    pub fn lookup(&self, token: &str) -> Option<Arc<ClientSession>> {
        self.sessions.get(token).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Sweeps dead sessions (stream destroyed / non-writable) out of the
    /// registry. Returns the number removed (spec §4.J).
    pub fn sweep(&self) -> usize {
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let alive = session.is_alive();
            if !alive {
                removed += 1;
            }
            alive
        });
        removed
    }

    pub fn iter_tokens(&self) -> Vec<(String, Arc<ClientSession>)> {
        self.sessions.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
