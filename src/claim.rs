//! Client borrows handed out by the registry.

use crate::backend::Client;
use crate::node::{NodeEntry, PoolId};

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::ops::Deref;
use std::sync::Arc;

/// A scoped borrow of one pool's capacity, carrying the underlying client
/// handle.
///
/// The handle is the only sanctioned way to use a pooled client. Dropping it
/// returns the reservation to the pool it was issued from exactly once, on
/// every exit path of the borrowing scope, and wakes waiters blocked on that
/// node.
#[derive_where(Debug)]
pub struct Handle<C: Client> {
    entry: DebugIgnore<Arc<NodeEntry<C>>>,
    client: DebugIgnore<Arc<C>>,
    pool: PoolId,
    generation: u64,
}

impl<C: Client> Handle<C> {
    pub(crate) fn new(
        entry: Arc<NodeEntry<C>>,
        pool: PoolId,
        generation: u64,
        client: Arc<C>,
    ) -> Self {
        Self {
            entry: DebugIgnore(entry),
            client: DebugIgnore(client),
            pool,
            generation,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// The repair generation of the pool this borrow was issued from.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<C: Client> Deref for Handle<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl<C: Client> Drop for Handle<C> {
    fn drop(&mut self) {
        self.entry.release(self.pool, self.generation);
    }
}
