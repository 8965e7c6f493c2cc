//! The peer set of a linked queue.
//!
//! Membership is mutually reflexive: linking installs both directions, so
//! if A lists B then B lists A. Peers are held weakly; a dropped queue
//! simply disappears from its peers' federations. Every accessor prunes
//! dead entries first, so all of them report live membership.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::domain::QueueId;

use super::runtime::QueueCore;

struct Peer {
    id: QueueId,
    core: Weak<QueueCore>,
}

/// The set of peer queues one linked queue can resolve dependencies in.
pub struct QueueFederation {
    members: Mutex<Vec<Peer>>,
}

impl QueueFederation {
    pub(crate) fn new() -> Self {
        Self {
            members: Mutex::new(Vec::new()),
        }
    }

    /// Lock the member list with dead peers pruned out.
    fn live(&self) -> MutexGuard<'_, Vec<Peer>> {
        let mut members = self.members.lock().expect("federation lock poisoned");
        members.retain(|peer| peer.core.strong_count() > 0);
        members
    }

    /// Add a peer. Returns whether it was new; repeated links are
    /// idempotent.
    pub(crate) fn insert(&self, id: QueueId, core: Weak<QueueCore>) -> bool {
        let mut members = self.live();
        if members.iter().any(|peer| peer.id == id) {
            return false;
        }
        members.push(Peer { id, core });
        true
    }

    pub fn contains(&self, id: QueueId) -> bool {
        self.live().iter().any(|peer| peer.id == id)
    }

    pub fn peer_ids(&self) -> Vec<QueueId> {
        self.live().iter().map(|peer| peer.id).collect()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live peers themselves.
    pub(crate) fn peers(&self) -> Vec<Arc<QueueCore>> {
        self.live()
            .iter()
            .filter_map(|peer| peer.core.upgrade())
            .collect()
    }
}
