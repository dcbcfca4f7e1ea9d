use crate::types::AccountId;
use std::collections::HashSet;
use std::sync::Mutex;

/// Answers blocking, hiding, and profile-sharing questions about remote
/// accounts. External collaborator.
pub trait RecipientOracle: Send + Sync {
    fn is_blocked(&self, account: &AccountId) -> bool;
    fn is_hidden(&self, account: &AccountId) -> bool;
    fn is_profile_whitelisted(&self, account: &AccountId) -> bool;
}

#[derive(Default)]
pub struct InMemoryOracle {
    blocked: Mutex<HashSet<AccountId>>,
    hidden: Mutex<HashSet<AccountId>>,
    whitelisted: Mutex<HashSet<AccountId>>,
}

impl InMemoryOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, account: AccountId) {
        self.blocked.lock().unwrap().insert(account);
    }

    pub fn hide(&self, account: AccountId) {
        self.hidden.lock().unwrap().insert(account);
    }

    pub fn whitelist(&self, account: AccountId) {
        self.whitelisted.lock().unwrap().insert(account);
    }
}

impl RecipientOracle for InMemoryOracle {
    fn is_blocked(&self, account: &AccountId) -> bool {
        self.blocked.lock().unwrap().contains(account)
    }

    fn is_hidden(&self, account: &AccountId) -> bool {
        self.hidden.lock().unwrap().contains(account)
    }

    fn is_profile_whitelisted(&self, account: &AccountId) -> bool {
        self.whitelisted.lock().unwrap().contains(account)
    }
}
