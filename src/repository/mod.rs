//! The domain API over the Store. Every lifecycle transition lives here as
//! one `sqlx` transaction; callers cannot compose two Repository calls into
//! something they treat as a single atomic operation — they can't.
//!
//! Grounded on the daemon's `tasks::storage::TaskStorage` (owner-matching
//! `WHERE id=? AND claimed_by=?` idiom) and `tasks::janitor`
//! (`atomic_claim_with_lease`, `release_expired_leases`).

mod attempts;
mod events;
mod state;
mod tasks;

use crate::store::Store;

#[derive(Clone)]
pub struct Repository {
    store: Store,
}

impl Repository {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        self.store.pool()
    }
}

pub use tasks::TaskFilter;
