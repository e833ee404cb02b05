//! The contract between the selection tree and the work it schedules.
//
//  Items are owned by the caller and shared with the tree through `Arc`. The tree
//  never looks inside an item beyond `readiness`, `is_finished` and the owner slot.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tree::NodeId;

/// Milliseconds since the Unix epoch. `0` is reserved for "unknown / check now".
pub type Timestamp = u64;

/// What an item says about itself at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not eligible before the given deadline.
    Cooldown(Timestamp),
    /// Will never be eligible again; dropped lazily the next time it is scanned.
    Cancelled,
}

/// Back-reference from an item to the leaf currently holding it.
///
/// Only the tree writes to it. Callers may read it (e.g. to find out whether an
/// item is still queued) but have no way to change it.
#[derive(Default)]
pub struct OwnerSlot(Mutex<Option<NodeId>>);

impl OwnerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<NodeId> {
        *self.0.lock()
    }

    pub(crate) fn set(&self, owner: Option<NodeId>) {
        *self.0.lock() = owner;
    }
}

impl fmt::Debug for OwnerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnerSlot").field(&self.get()).finish()
    }
}

/// Anything the tree can schedule: a block fetch, a segment insert, ...
pub trait Schedulable {
    /// Must be cheap and safe to call repeatedly; it is queried on every probe.
    fn readiness(&self, now: Timestamp) -> Readiness;

    /// Items reporting `true` are refused by `add`.
    fn is_finished(&self) -> bool {
        false
    }

    fn owner_slot(&self) -> &OwnerSlot;
}

/// Per-call reason to skip an otherwise ready item, e.g. "its target peer is
/// overloaded right now".
///
/// Returns `0` when the item is not excluded, otherwise the time after which the
/// exclusion may lift. A time at or before `now` counts as not excluded.
pub trait ExclusionCheck<I: ?Sized> {
    fn exclude(&self, item: &I, now: Timestamp) -> Timestamp;
}

impl<I: ?Sized, F> ExclusionCheck<I> for F
where
    F: Fn(&I, Timestamp) -> Timestamp,
{
    fn exclude(&self, item: &I, now: Timestamp) -> Timestamp {
        self(item, now)
    }
}

/// Exclusion check that never excludes anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoExclusion;

impl<I: ?Sized> ExclusionCheck<I> for NoExclusion {
    fn exclude(&self, _item: &I, _now: Timestamp) -> Timestamp {
        0
    }
}

/// Outcome of one `remove_random` call.
#[derive(Debug)]
pub enum Selection<I> {
    /// The picked item. It has already left the tree.
    Item(Arc<I>),
    /// Nothing under this node can run before the given time.
    Wakeup(Timestamp),
    /// Nothing is queued under this node at all.
    Empty,
}

impl<I> Selection<I> {
    pub fn item(&self) -> Option<&Arc<I>> {
        match self {
            Selection::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn into_item(self) -> Option<Arc<I>> {
        match self {
            Selection::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn wakeup(&self) -> Option<Timestamp> {
        match self {
            Selection::Wakeup(t) => Some(*t),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Selection::Empty)
    }
}

/// How a scan treats one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Valid,
    /// Cooldown or caller exclusion, lifting at the given time.
    Wait(Timestamp),
    Cancelled,
}

pub(crate) fn classify<I, E>(item: &I, exclusion: &E, now: Timestamp) -> Verdict
where
    I: Schedulable + ?Sized,
    E: ExclusionCheck<I> + ?Sized,
{
    match item.readiness(now) {
        Readiness::Cancelled => Verdict::Cancelled,
        Readiness::Cooldown(until) if until > now => Verdict::Wait(until),
        Readiness::Ready | Readiness::Cooldown(_) => match exclusion.exclude(item, now) {
            until if until > now => Verdict::Wait(until),
            // 0, or a deadline that has already passed
            _ => Verdict::Valid,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Readiness, OwnerSlot);

    impl Schedulable for Fixed {
        fn readiness(&self, _now: Timestamp) -> Readiness {
            self.0
        }

        fn owner_slot(&self) -> &OwnerSlot {
            &self.1
        }
    }

    fn fixed(r: Readiness) -> Fixed {
        Fixed(r, OwnerSlot::new())
    }

    #[test]
    fn expired_cooldown_counts_as_ready() {
        let item = fixed(Readiness::Cooldown(1_000));
        assert_eq!(classify(&item, &NoExclusion, 1_000), Verdict::Valid);
        assert_eq!(classify(&item, &NoExclusion, 999), Verdict::Wait(1_000));
    }

    #[test]
    fn exclusion_only_applies_to_ready_items() {
        let exclude_all = |_: &Fixed, now: Timestamp| now + 50;

        assert_eq!(
            classify(&fixed(Readiness::Ready), &exclude_all, 100),
            Verdict::Wait(150)
        );
        assert_eq!(
            classify(&fixed(Readiness::Cancelled), &exclude_all, 100),
            Verdict::Cancelled
        );
        assert_eq!(
            classify(&fixed(Readiness::Cooldown(500)), &exclude_all, 100),
            Verdict::Wait(500),
            "item's own cooldown wins over the caller's exclusion"
        );
    }

    #[test]
    fn lapsed_exclusion_deadline_counts_as_ready() {
        let ready = fixed(Readiness::Ready);
        let lapsed = |_: &Fixed, now: Timestamp| now - 10;
        let due_now = |_: &Fixed, now: Timestamp| now;

        assert_eq!(classify(&ready, &lapsed, 100), Verdict::Valid);
        assert_eq!(classify(&ready, &due_now, 100), Verdict::Valid);
    }

    #[test]
    fn owner_slot_starts_empty() {
        let item = fixed(Readiness::Ready);
        assert_eq!(item.owner_slot().get(), None);
    }
}
