//! Client id allocation.
//!
//! Ids are handed out cyclically over the whole `u16` space, skipping any id
//! whose previous holder is still connected. An id returns to the pool when
//! its [`ClientIdLease`] is dropped, which happens when the connection task
//! ends.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::ClientId;

/// Number of distinct client ids.
pub const ID_SPACE: usize = ClientId::MAX as usize + 1;

struct PoolState {
    /// Next candidate id.
    cursor: ClientId,
    held: HashSet<ClientId>,
    limit: usize,
}

/// Shared allocator; clones refer to the same pool.
#[derive(Clone)]
pub struct IdPool {
    state: Arc<Mutex<PoolState>>,
}

impl IdPool {
    /// `max_connections == 0` means only the id space itself is the limit.
    pub fn new(max_connections: usize) -> Self {
        let limit = match max_connections {
            0 => ID_SPACE,
            n => n.min(ID_SPACE),
        };
        Self {
            state: Arc::new(Mutex::new(PoolState {
                cursor: 0,
                held: HashSet::new(),
                limit,
            })),
        }
    }

    /// Reserve the next free id, or `None` when the server is full.
    pub fn acquire(&self) -> Option<ClientIdLease> {
        let mut state = lock(&self.state);
        if state.held.len() >= state.limit {
            return None;
        }
        // held.len() < ID_SPACE, so a free id exists within one lap.
        loop {
            let id = state.cursor;
            state.cursor = state.cursor.wrapping_add(1);
            if state.held.insert(id) {
                return Some(ClientIdLease {
                    id,
                    state: self.state.clone(),
                });
            }
        }
    }

    /// Ids currently leased out, i.e. live connections.
    pub fn in_use(&self) -> usize {
        lock(&self.state).held.len()
    }

    pub fn limit(&self) -> usize {
        lock(&self.state).limit
    }
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ownership of one id. Dropping it frees the id.
pub struct ClientIdLease {
    id: ClientId,
    state: Arc<Mutex<PoolState>>,
}

impl ClientIdLease {
    pub fn id(&self) -> ClientId {
        self.id
    }
}

impl std::fmt::Debug for ClientIdLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ClientIdLease").field(&self.id).finish()
    }
}

impl Drop for ClientIdLease {
    fn drop(&mut self) {
        lock(&self.state).held.remove(&self.id);
    }
}
