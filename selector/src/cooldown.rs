//! Per-node cached wakeup time.
//!
//! The cached value is a lower bound: nothing under the node is known to be
//! runnable before it. It may be too early, never too late. `0` means unknown.
//! Propagation along parent links lives in the tree; this type only holds one
//! node's value.

use std::fmt;
use std::hash::Hash;

use tracing::trace;

use crate::error::TreeError;
use crate::item::{Schedulable, Timestamp};
use crate::tree::{NodeId, SelectionTree};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WakeupCache(Timestamp);

impl WakeupCache {
    /// Current value, forgetting it first if it has already passed.
    pub(crate) fn get(&mut self, now: Timestamp) -> Timestamp {
        if self.0 != 0 && self.0 <= now {
            self.0 = 0;
        }
        self.0
    }

    /// Value without expiry, for inspection only.
    pub(crate) fn peek(&self) -> Timestamp {
        self.0
    }

    /// Record a bound established by scanning everything under the node.
    pub(crate) fn set(&mut self, wakeup: Timestamp) {
        self.0 = wakeup;
    }

    /// Tighten the bound. Returns whether anything changed, in which case the
    /// parent must be tightened too.
    pub(crate) fn reduce(&mut self, wakeup: Timestamp) -> bool {
        if wakeup < self.0 {
            self.0 = wakeup;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Running minimum over the wakeup times reported by several children or items.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct MinWakeup(Option<Timestamp>);

impl MinWakeup {
    pub(crate) fn record(&mut self, wakeup: Timestamp) {
        self.0 = Some(match self.0 {
            Some(cur) => cur.min(wakeup),
            None => wakeup,
        });
    }

    pub(crate) fn get(&self) -> Option<Timestamp> {
        self.0
    }
}

impl<K, I> SelectionTree<K, I>
where
    K: Hash + Eq + Clone + fmt::Debug,
    I: Schedulable,
{
    /// Cached wakeup of `id`, or `0` if unknown or already due. A due value is
    /// forgotten as a side effect.
    pub fn get_wakeup_time(&mut self, id: NodeId, now: Timestamp) -> Result<Timestamp, TreeError> {
        Ok(self.node_mut(id)?.wakeup.get(now))
    }

    /// Cached wakeup of `id` as stored, without expiring it.
    pub fn cached_wakeup(&self, id: NodeId) -> Result<Timestamp, TreeError> {
        Ok(self.node(id)?.wakeup.peek())
    }

    /// Tighten the cached wakeup of `id` and of each ancestor, stopping at the
    /// first node whose bound is already at least as early.
    pub fn reduce_wakeup_time(&mut self, id: NodeId, wakeup: Timestamp) -> Result<(), TreeError> {
        let mut cursor = Some(id);
        while let Some(n) = cursor {
            let node = self.node_mut(n)?;
            if !node.wakeup.reduce(wakeup) {
                break;
            }
            trace!(node = %n, wakeup, "wakeup reduced");
            cursor = node.parent;
        }
        Ok(())
    }

    /// Forget the cached wakeup of `id` and every ancestor.
    pub fn clear_wakeup_time(&mut self, id: NodeId) -> Result<(), TreeError> {
        let mut cursor = Some(id);
        while let Some(n) = cursor {
            let node = self.node_mut(n)?;
            node.wakeup.clear();
            cursor = node.parent;
        }
        Ok(())
    }

    /// Record a bound found by examining everything under `id`, then tighten
    /// the ancestors with it.
    pub(crate) fn settle_wakeup(&mut self, id: NodeId, wakeup: Timestamp) -> Result<(), TreeError> {
        let node = self.node_mut(id)?;
        node.wakeup.set(wakeup);
        let parent = node.parent;
        match parent {
            Some(parent) => self.reduce_wakeup_time(parent, wakeup),
            None => Ok(()),
        }
    }
}
