//! Usernames that have logged in successfully during the run.
//!
//! Every virtual user holds an [`Arc<Registry>`](Registry) handed to it at spawn
//! time. Entries are only ever appended, so an index that was valid once stays
//! valid (and keeps pointing at the same username) for the rest of the run.

use std::sync::{Arc, RwLock};

use rand::Rng;

use crate::error::Error;

#[derive(Debug, Default)]
pub struct Registry {
    users: RwLock<Vec<Arc<str>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a username. Visible to every reader once this returns.
    pub fn append(&self, username: impl Into<Arc<str>>) {
        let username = username.into();
        self.users
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(username);
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn snapshot(&self) -> Vec<Arc<str>> {
        self.read().clone()
    }

    /// Pick a random registered username that is not `username`.
    ///
    /// Draws uniformly up to `max_attempts` times. If every draw hits the caller,
    /// the entries are scanned once from a random offset, so the call always
    /// terminates and only fails when no other username is registered.
    pub fn pick_recipient<R: Rng + ?Sized>(
        &self,
        username: &str,
        rng: &mut R,
        max_attempts: usize,
    ) -> Result<Arc<str>, Error> {
        let users = self.read();
        let len = users.len();
        if len == 0 {
            return Err(Error::NoRecipient {
                username: username.to_string(),
                candidates: 0,
            });
        }

        for _ in 0..max_attempts {
            let candidate = &users[rng.gen_range(0..len)];
            if &**candidate != username {
                return Ok(candidate.clone());
            }
        }

        let offset = rng.gen_range(0..len);
        users
            .iter()
            .cycle()
            .skip(offset)
            .take(len)
            .find(|candidate| &***candidate != username)
            .cloned()
            .ok_or_else(|| Error::NoRecipient {
                username: username.to_string(),
                candidates: len,
            })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<str>>> {
        self.users
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
