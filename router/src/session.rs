use std::collections::HashSet;
use std::sync::Mutex;

use uuid::Uuid;

/// The set of live client identities. Write-mostly: IDs are minted on
/// connect and never evicted or reused for the life of the process.
pub struct SessionRegistry {
    clients: Mutex<HashSet<String>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashSet::new()),
        }
    }

    /// Mint a fresh client id and register it as live.
    pub fn connect(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone());
        id
    }

    pub fn is_known(&self, client_id: &str) -> bool {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(client_id)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_yields_distinct_ids() {
        let registry = SessionRegistry::new();
        let a = registry.connect();
        let b = registry.connect();
        assert_ne!(a, b);
        assert!(registry.is_known(&a));
        assert!(registry.is_known(&b));
    }

    #[test]
    fn unknown_client_is_not_known() {
        let registry = SessionRegistry::new();
        assert!(!registry.is_known("not-a-real-id"));
    }
}
