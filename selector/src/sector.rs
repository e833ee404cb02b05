//! Sector container: fans out over child containers keyed by client.
//!
//! Fairness: each direct child has the same chance of being probed, however many
//! items it holds. A client with one queued fetch competes on equal terms with a
//! client queueing a thousand.

use std::fmt;
use std::hash::Hash;

use indexmap::IndexMap;
use rand::Rng;
use tracing::{debug, trace};

use crate::cooldown::MinWakeup;
use crate::error::TreeError;
use crate::item::{ExclusionCheck, Schedulable, Selection, Timestamp};
use crate::tree::{NodeId, SelectionTree};

/// Children by client key, with a dense positional index for O(1) uniform picks.
/// `IndexMap` keeps the hash lookup and the flat index in one structure, so they
/// can never disagree in size or membership.
pub(crate) struct Sector<K> {
    children: IndexMap<K, NodeId>,
}

impl<K: Hash + Eq> Sector<K> {
    pub(crate) fn new() -> Self {
        Self {
            children: IndexMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub(crate) fn get(&self, key: &K) -> Option<NodeId> {
        self.children.get(key).copied()
    }

    pub(crate) fn child_at(&self, index: usize) -> Option<NodeId> {
        self.children.get_index(index).map(|(_, id)| *id)
    }

    pub(crate) fn key_at(&self, index: usize) -> Option<&K> {
        self.children.get_index(index).map(|(k, _)| k)
    }

    /// `false` if the key was already present (nothing is replaced).
    pub(crate) fn insert(&mut self, key: K, child: NodeId) -> bool {
        match self.children.entry(key) {
            indexmap::map::Entry::Occupied(_) => false,
            indexmap::map::Entry::Vacant(v) => {
                v.insert(child);
                true
            }
        }
    }

    /// O(1): the last child takes the removed child's position.
    pub(crate) fn remove(&mut self, key: &K) -> Option<NodeId> {
        self.children.swap_remove(key)
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.children.keys()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (&K, NodeId)> + '_ {
        self.children.iter().map(|(k, id)| (k, *id))
    }
}

impl<K, I> SelectionTree<K, I>
where
    K: Hash + Eq + Clone + fmt::Debug,
    I: Schedulable,
{
    pub(crate) fn sector_remove_random<E, R>(
        &mut self,
        id: NodeId,
        exclusion: &E,
        now: Timestamp,
        rng: &mut R,
    ) -> Result<Selection<I>, TreeError>
    where
        E: ExclusionCheck<I> + ?Sized,
        R: Rng + ?Sized,
    {
        let limit = self.config.exclusion_limit;
        let mut excluded = 0usize;

        loop {
            let count = self.sector(id)?.len();
            match count {
                0 => return Ok(Selection::Empty),
                // Probing every child costs at most two probes here, and only a
                // full probe can set this node's own wakeup.
                1 | 2 => return self.probe_all(id, exclusion, now, rng),
                _ => {}
            }

            let index = rng.gen_range(0..count);
            let child = self.sector(id)?.child_at(index).ok_or_else(|| {
                TreeError::Invariant(format!("sector {id} has no child at {index} of {count}"))
            })?;

            match self.probe(id, child, exclusion, now, rng)? {
                Selection::Item(item) => return Ok(Selection::Item(item)),
                // Detached already; the population shrank so this terminates.
                Selection::Empty => continue,
                Selection::Wakeup(_) => {
                    excluded += 1;
                    if excluded > limit {
                        debug!(
                            sector = %id,
                            children = count,
                            excluded,
                            "too many children in cooldown; sweeping all of them"
                        );
                        return self.probe_all(id, exclusion, now, rng);
                    }
                }
            }
        }
    }

    /// Probe every child once, starting at a random position. If none yields an
    /// item, the minimum of their wakeups is a real bound for this node.
    fn probe_all<E, R>(
        &mut self,
        id: NodeId,
        exclusion: &E,
        now: Timestamp,
        rng: &mut R,
    ) -> Result<Selection<I>, TreeError>
    where
        E: ExclusionCheck<I> + ?Sized,
        R: Rng + ?Sized,
    {
        // Snapshot: detaching during the sweep reorders the flat index.
        let mut children: Vec<NodeId> = self.sector(id)?.ids().collect();
        if children.is_empty() {
            return Ok(Selection::Empty);
        }
        let start = rng.gen_range(0..children.len());
        children.rotate_left(start);

        let mut waiting = MinWakeup::default();
        for child in children {
            match self.probe(id, child, exclusion, now, rng)? {
                Selection::Item(item) => return Ok(Selection::Item(item)),
                Selection::Wakeup(wakeup) => waiting.record(wakeup),
                Selection::Empty => {}
            }
        }

        match waiting.get() {
            Some(wakeup) => {
                trace!(sector = %id, wakeup, "every child is waiting");
                self.settle_wakeup(id, wakeup)?;
                Ok(Selection::Wakeup(wakeup))
            }
            None => Ok(Selection::Empty),
        }
    }

    /// Run one selection on `child` and detach it if that left it empty.
    fn probe<E, R>(
        &mut self,
        id: NodeId,
        child: NodeId,
        exclusion: &E,
        now: Timestamp,
        rng: &mut R,
    ) -> Result<Selection<I>, TreeError>
    where
        E: ExclusionCheck<I> + ?Sized,
        R: Rng + ?Sized,
    {
        let out = self.select_from(child, exclusion, now, rng)?;
        if self.is_empty(child)? {
            self.detach(id, child)?;
        }
        Ok(out)
    }
}
