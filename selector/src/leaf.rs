//! Leaf container: the items queued by one scheduling unit.
//!
//! Two removal strategies:
//!   - probabilistic: probe random slots, cheap while few items are excluded
//!   - exhaustive: compact the whole array and pick uniformly among valid items
//!     in at most two passes, without an auxiliary buffer
//!
//! The leaf knows its own id (to stamp owner slots) but nothing about its parent;
//! wakeup bookkeeping and detaching are done by the tree.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::blocks::BlockArray;
use crate::cooldown::MinWakeup;
use crate::error::TreeError;
use crate::item::{ExclusionCheck, Schedulable, Selection, Timestamp, Verdict, classify};
use crate::tree::NodeId;

pub(crate) struct Leaf<I> {
    items: BlockArray<Arc<I>>,
}

/// What one compacting pass saw.
#[derive(Debug, Default)]
struct ScanPass {
    valid: usize,
    waiting: usize,
    min_wakeup: MinWakeup,
    /// Compacted index of the valid item whose rank matched the target.
    chosen: Option<usize>,
    /// Compacted index of the last valid item seen.
    last_valid: Option<usize>,
    dropped: usize,
}

impl<I: Schedulable> Leaf<I> {
    pub(crate) fn new(block_size: usize, min_size: usize) -> Self {
        Self {
            items: BlockArray::new(block_size, min_size),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<I>> + '_ {
        self.items.iter()
    }

    pub(crate) fn contains(&self, item: &Arc<I>) -> bool {
        self.position(item).is_some()
    }

    fn position(&self, item: &Arc<I>) -> Option<usize> {
        self.items.iter().position(|x| Arc::ptr_eq(x, item))
    }

    /// Queue `item` here. `Ok(false)` if it was refused (finished, or already
    /// queued on this leaf).
    pub(crate) fn add(&mut self, me: NodeId, item: Arc<I>) -> Result<bool, TreeError> {
        if item.is_finished() {
            trace!(node = %me, "refusing finished item");
            return Ok(false);
        }

        match item.owner_slot().get() {
            Some(owner) if owner == me => {
                debug!(node = %me, "item already queued here; ignoring");
                return Ok(false);
            }
            Some(owner) => return Err(TreeError::AlreadyOwned { owner }),
            None => {}
        }

        // Best-effort duplicate check while the array is small. The owner slot
        // already rules out duplicates unless someone bypassed it.
        if self.items.len() < self.items.min_size() && self.contains(&item) {
            warn!(node = %me, "unowned item found in leaf");
            return Err(TreeError::Invariant(format!(
                "leaf {me} holds an item whose owner slot is empty"
            )));
        }

        item.owner_slot().set(Some(me));
        self.items.push(item);
        Ok(true)
    }

    /// Detach `item` by identity. The caller has already checked the owner slot.
    pub(crate) fn remove(&mut self, me: NodeId, item: &Arc<I>) -> Result<(), TreeError> {
        let idx = self.position(item).ok_or_else(|| {
            warn!(node = %me, "owner slot points at a leaf that lacks the item");
            TreeError::Invariant(format!("item claims leaf {me} but is not stored there"))
        })?;
        if let Some(removed) = self.items.swap_remove(idx) {
            removed.owner_slot().set(None);
        }
        Ok(())
    }

    /// Release every item, clearing owner slots. Returns how many there were.
    pub(crate) fn drain(&mut self) -> usize {
        let mut released = 0;
        while let Some(item) = self.items.swap_remove(0) {
            item.owner_slot().set(None);
            released += 1;
        }
        released
    }

    pub(crate) fn remove_random<E, R>(
        &mut self,
        me: NodeId,
        exclusion: &E,
        now: Timestamp,
        rng: &mut R,
        exclusion_limit: usize,
    ) -> Result<Selection<I>, TreeError>
    where
        E: ExclusionCheck<I> + ?Sized,
        R: Rng + ?Sized,
    {
        let mut excluded = 0usize;

        loop {
            let n = self.items.len();
            if n == 0 {
                return Ok(Selection::Empty);
            }
            if n < exclusion_limit {
                break;
            }

            let idx = rng.gen_range(0..n);
            let item = self.slot(me, idx)?;

            match classify(item.as_ref(), exclusion, now) {
                Verdict::Cancelled => {
                    if let Some(dead) = self.items.swap_remove(idx) {
                        dead.owner_slot().set(None);
                    }
                    trace!(node = %me, len = self.items.len(), "dropped cancelled item");
                }
                Verdict::Wait(_) => {
                    excluded += 1;
                    if excluded > exclusion_limit {
                        debug!(
                            node = %me,
                            len = n,
                            excluded,
                            "too many excluded probes; switching to exhaustive scan"
                        );
                        break;
                    }
                }
                Verdict::Valid => return self.take_at(me, idx).map(Selection::Item),
            }
        }

        self.remove_exhaustive(me, exclusion, now, rng)
    }

    fn remove_exhaustive<E, R>(
        &mut self,
        me: NodeId,
        exclusion: &E,
        now: Timestamp,
        rng: &mut R,
    ) -> Result<Selection<I>, TreeError>
    where
        E: ExclusionCheck<I> + ?Sized,
        R: Rng + ?Sized,
    {
        let mut target = None;

        loop {
            let pass = self.scan_pass(me, exclusion, now, target)?;

            trace!(
                node = %me,
                len = self.items.len(),
                valid = pass.valid,
                excluded = pass.waiting,
                dropped = pass.dropped,
                "exhaustive pass"
            );

            if pass.valid == 0 {
                return Ok(match pass.min_wakeup.get() {
                    Some(wakeup) if pass.waiting > 0 => Selection::Wakeup(wakeup),
                    _ => Selection::Empty,
                });
            }

            let pick = if pass.valid == 1 {
                pass.last_valid
            } else {
                pass.chosen
            };

            if let Some(idx) = pick {
                return self.take_at(me, idx).map(Selection::Item);
            }

            // Several candidates and none chosen yet (or the target fell off the
            // end because something changed underneath): pick a rank and rescan.
            target = Some(rng.gen_range(0..pass.valid));
        }
    }

    /// One linear pass: drop cancelled items, pack survivors from index 0,
    /// count valid and waiting items, and remember the valid item of rank
    /// `target` if one is given.
    fn scan_pass<E>(
        &mut self,
        me: NodeId,
        exclusion: &E,
        now: Timestamp,
        target: Option<usize>,
    ) -> Result<ScanPass, TreeError>
    where
        E: ExclusionCheck<I> + ?Sized,
    {
        let mut pass = ScanPass::default();
        let len = self.items.len();
        let mut write = 0usize;

        for read in 0..len {
            let Some(item) = self.items.take(read) else {
                // Leave the array consistent before bailing out.
                self.items.set_len(write);
                return Err(TreeError::Invariant(format!(
                    "leaf {me} has a hole at live slot {read}"
                )));
            };

            match classify(item.as_ref(), exclusion, now) {
                Verdict::Cancelled => {
                    item.owner_slot().set(None);
                    pass.dropped += 1;
                    continue;
                }
                Verdict::Wait(until) => {
                    pass.waiting += 1;
                    pass.min_wakeup.record(until);
                }
                Verdict::Valid => {
                    if target == Some(pass.valid) {
                        pass.chosen = Some(write);
                    }
                    pass.valid += 1;
                    pass.last_valid = Some(write);
                }
            }

            self.items.put(write, item);
            write += 1;
        }

        self.items.set_len(write);
        Ok(pass)
    }

    fn slot(&self, me: NodeId, idx: usize) -> Result<&Arc<I>, TreeError> {
        self.items
            .get(idx)
            .ok_or_else(|| TreeError::Invariant(format!("leaf {me} has a hole at live slot {idx}")))
    }

    /// Remove and return the item at `idx`, after checking it really belongs here.
    fn take_at(&mut self, me: NodeId, idx: usize) -> Result<Arc<I>, TreeError> {
        let owner = self.slot(me, idx)?.owner_slot().get();
        if owner != Some(me) {
            warn!(node = %me, ?owner, "picked item with a foreign owner");
            return Err(TreeError::Invariant(format!(
                "item in leaf {me} has owner {owner:?}"
            )));
        }

        let item = self
            .items
            .swap_remove(idx)
            .ok_or_else(|| TreeError::Invariant(format!("leaf {me} lost slot {idx}")))?;
        item.owner_slot().set(None);
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{NoExclusion, OwnerSlot, Readiness};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    struct Job {
        id: usize,
        readiness: Readiness,
        owner: OwnerSlot,
    }

    impl Schedulable for Job {
        fn readiness(&self, _now: Timestamp) -> Readiness {
            self.readiness
        }

        fn owner_slot(&self) -> &OwnerSlot {
            &self.owner
        }
    }

    fn job(id: usize, readiness: Readiness) -> Arc<Job> {
        Arc::new(Job {
            id,
            readiness,
            owner: OwnerSlot::new(),
        })
    }

    fn me() -> NodeId {
        NodeId::new(0, 0)
    }

    fn leaf_with(jobs: &[Arc<Job>]) -> Leaf<Job> {
        let mut leaf = Leaf::new(1024, 32);
        for j in jobs {
            assert!(leaf.add(me(), j.clone()).unwrap());
        }
        leaf
    }

    #[test]
    fn exhaustive_returns_each_item_once() {
        let jobs: Vec<_> = (0..3).map(|i| job(i, Readiness::Ready)).collect();
        let mut leaf = leaf_with(&jobs);
        let mut rng = StdRng::seed_from_u64(7);

        let mut seen = HashSet::new();
        for _ in 0..3 {
            let picked = leaf
                .remove_random(me(), &NoExclusion, 0, &mut rng, 10)
                .unwrap()
                .into_item()
                .expect("item");
            assert!(seen.insert(picked.id), "item returned twice");
            assert_eq!(picked.owner_slot().get(), None);
        }
        assert!(
            leaf.remove_random(me(), &NoExclusion, 0, &mut rng, 10)
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn cooldown_item_yields_wakeup_and_stays() {
        let j = job(1, Readiness::Cooldown(2_000));
        let mut leaf = leaf_with(&[j.clone()]);
        let mut rng = StdRng::seed_from_u64(1);

        let out = leaf
            .remove_random(me(), &NoExclusion, 1_000, &mut rng, 10)
            .unwrap();
        assert_eq!(out.wakeup(), Some(2_000));
        assert_eq!(leaf.len(), 1);
        assert_eq!(j.owner_slot().get(), Some(me()));
    }

    #[test]
    fn cancelled_items_are_compacted_away() {
        let jobs = vec![
            job(0, Readiness::Cancelled),
            job(1, Readiness::Cooldown(500)),
            job(2, Readiness::Cancelled),
            job(3, Readiness::Cooldown(300)),
        ];
        let mut leaf = leaf_with(&jobs);
        let mut rng = StdRng::seed_from_u64(3);

        let out = leaf
            .remove_random(me(), &NoExclusion, 100, &mut rng, 10)
            .unwrap();
        assert_eq!(out.wakeup(), Some(300));
        assert_eq!(leaf.len(), 2);
        assert_eq!(jobs[0].owner_slot().get(), None);
        assert_eq!(jobs[2].owner_slot().get(), None);
        let ids: Vec<_> = leaf.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 3], "survivors packed in order");
    }

    #[test]
    fn all_cancelled_is_empty() {
        let jobs: Vec<_> = (0..5).map(|i| job(i, Readiness::Cancelled)).collect();
        let mut leaf = leaf_with(&jobs);
        let mut rng = StdRng::seed_from_u64(3);

        assert!(
            leaf.remove_random(me(), &NoExclusion, 0, &mut rng, 10)
                .unwrap()
                .is_empty()
        );
        assert!(leaf.is_empty());
    }

    #[test]
    fn probabilistic_falls_back_when_mostly_excluded() {
        // 200 waiting items and a single ready one: random probing will blow the
        // exclusion budget and the exhaustive scan must still find the ready one.
        let mut jobs: Vec<_> = (0..200).map(|i| job(i, Readiness::Cooldown(10_000))).collect();
        jobs.push(job(999, Readiness::Ready));
        let mut leaf = leaf_with(&jobs);
        let mut rng = StdRng::seed_from_u64(11);

        let picked = leaf
            .remove_random(me(), &NoExclusion, 0, &mut rng, 10)
            .unwrap()
            .into_item()
            .expect("the ready item");
        assert_eq!(picked.id, 999);
        assert_eq!(leaf.len(), 200);

        let next = leaf
            .remove_random(me(), &NoExclusion, 0, &mut rng, 10)
            .unwrap();
        assert_eq!(next.wakeup(), Some(10_000));
    }

    #[test]
    fn exclusion_check_is_honoured() {
        let jobs: Vec<_> = (0..4).map(|i| job(i, Readiness::Ready)).collect();
        let mut leaf = leaf_with(&jobs);
        let mut rng = StdRng::seed_from_u64(5);
        let only_two = |j: &Job, now: Timestamp| if j.id == 2 { 0 } else { now + 100 };

        let picked = leaf
            .remove_random(me(), &only_two, 50, &mut rng, 10)
            .unwrap()
            .into_item()
            .unwrap();
        assert_eq!(picked.id, 2);

        let out = leaf.remove_random(me(), &only_two, 50, &mut rng, 10).unwrap();
        assert_eq!(out.wakeup(), Some(150));
    }

    #[test]
    fn add_refuses_finished_and_foreign_items() {
        struct Done(OwnerSlot);
        impl Schedulable for Done {
            fn readiness(&self, _now: Timestamp) -> Readiness {
                Readiness::Ready
            }
            fn is_finished(&self) -> bool {
                true
            }
            fn owner_slot(&self) -> &OwnerSlot {
                &self.0
            }
        }

        let mut done_leaf = Leaf::new(1024, 32);
        assert!(!done_leaf.add(me(), Arc::new(Done(OwnerSlot::new()))).unwrap());
        assert!(done_leaf.is_empty());

        let j = job(1, Readiness::Ready);
        let mut leaf = leaf_with(&[j.clone()]);
        assert!(!leaf.add(me(), j.clone()).unwrap(), "re-adding is a no-op");
        assert_eq!(leaf.len(), 1);

        let mut other = Leaf::new(1024, 32);
        let err = other.add(NodeId::new(1, 0), j).unwrap_err();
        assert_eq!(err, TreeError::AlreadyOwned { owner: me() });
    }

    #[test]
    fn remove_detaches_by_identity() {
        let jobs: Vec<_> = (0..3).map(|i| job(i, Readiness::Ready)).collect();
        let mut leaf = leaf_with(&jobs);

        leaf.remove(me(), &jobs[1]).unwrap();
        assert_eq!(leaf.len(), 2);
        assert!(!leaf.contains(&jobs[1]));
        assert_eq!(jobs[1].owner_slot().get(), None);

        assert!(matches!(
            leaf.remove(me(), &jobs[1]),
            Err(TreeError::Invariant(_))
        ));
    }

    #[test]
    fn strategies_draw_from_the_same_eligible_set() {
        // Five ready items and five waiting ones; with a limit below the size the
        // probabilistic strategy runs, with a limit above it the exhaustive one.
        let eligible: HashSet<usize> = (0..5).collect();
        for limit in [2usize, 20] {
            let mut jobs: Vec<_> = (0..5).map(|i| job(i, Readiness::Ready)).collect();
            jobs.extend((5..10).map(|i| job(i, Readiness::Cooldown(1_000))));
            let mut leaf = leaf_with(&jobs);
            let mut rng = StdRng::seed_from_u64(99);

            let mut picked = HashSet::new();
            while let Selection::Item(j) = leaf
                .remove_random(me(), &NoExclusion, 0, &mut rng, limit)
                .unwrap()
            {
                picked.insert(j.id);
            }
            assert_eq!(picked, eligible, "limit {limit}");
        }
    }
}
