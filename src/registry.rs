use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Per-client admission control
// ---------------------------------------------------------------------------

/// Counts active downloads per client and gates new ones against a limit.
///
/// Entries are created on the first admission attempt for a client and are
/// never removed; only their counts move. Check and increment happen under
/// one lock so two racing requests can never both take the last slot.
#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<HashMap<String, usize>>,
}

impl SessionRegistry {
    /// Admit `client` if it holds fewer than `max_sessions` active downloads.
    /// Returns false (and leaves the count untouched) when at the limit.
    pub fn try_admit(&self, client: &str, max_sessions: usize) -> bool {
        let mut map = self.active.lock();
        let count = map.entry(client.to_string()).or_insert(0);
        if *count >= max_sessions {
            return false;
        }
        *count += 1;
        true
    }

    /// Give back one slot. Saturates at zero; unknown clients are ignored.
    pub fn release(&self, client: &str) {
        if let Some(count) = self.active.lock().get_mut(client) {
            *count = count.saturating_sub(1);
        }
    }

    /// Current number of active downloads for `client`.
    pub fn active(&self, client: &str) -> usize {
        self.active.lock().get(client).copied().unwrap_or(0)
    }

    /// Like [`try_admit`](Self::try_admit), but hands back a slot that
    /// releases itself when dropped.
    pub fn admit(self: &Arc<Self>, client: &str, max_sessions: usize) -> Option<SessionSlot> {
        self.try_admit(client, max_sessions).then(|| SessionSlot {
            registry: self.clone(),
            client: client.to_string(),
        })
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("clients", &self.active.lock().len())
            .finish()
    }
}

/// One admitted download. Dropping it releases the slot exactly once.
#[derive(Debug)]
pub struct SessionSlot {
    registry: Arc<SessionRegistry>,
    client: String,
}

impl SessionSlot {
    pub(crate) fn client(&self) -> &str {
        &self.client
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.registry.release(&self.client);
    }
}
