//! Credential registry mapping shared secrets to caller supplied identities.
//!
//! The whole mapping is replaced on update. Readers take a snapshot `Arc` and never
//! observe a partially updated table.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

/// Opaque identity bound to an authenticated connection.
pub trait Identity: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Identity for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

pub struct UserRegistry<U> {
    users: RwLock<Arc<HashMap<String, U>>>,
}

impl<U> std::fmt::Debug for UserRegistry<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserRegistry")
            .field("num_users", &self.users.read().len())
            .finish()
    }
}

impl<U: Identity> Default for UserRegistry<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U: Identity> UserRegistry<U> {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Replaces every credential. `users[i]` is identified by `passwords[i]`; when
    /// the same password appears more than once the last entry wins.
    pub fn update_users(&self, users: Vec<U>, passwords: Vec<String>) -> std::io::Result<()> {
        if users.len() != passwords.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "mismatched user count ({}) and password count ({})",
                    users.len(),
                    passwords.len()
                ),
            ));
        }
        let table: HashMap<String, U> = passwords.into_iter().zip(users).collect();
        *self.users.write() = Arc::new(table);
        Ok(())
    }

    pub fn lookup(&self, secret: &str) -> Option<U> {
        self.snapshot().get(secret).cloned()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, U>> {
        self.users.read().clone()
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
