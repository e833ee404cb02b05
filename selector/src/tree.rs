//! Arena-backed selection tree.
//!
//! Nodes live in a slot vector and refer to each other by [`NodeId`]; parents
//! hold their children in a [`Sector`], children hold their parent's id. An id
//! carries a generation, so an id kept after its node was detached is rejected
//! instead of silently aliasing a newer node.
//!
//! Locking: every method takes `&mut self`. Wrap the tree in one
//! [`SharedTree`] mutex per scheduling domain; there is no per-node locking.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, instrument, trace, warn};

use crate::config::SelectorConfig;
use crate::cooldown::WakeupCache;
use crate::error::TreeError;
use crate::item::{ExclusionCheck, Schedulable, Selection, Timestamp};
use crate::leaf::Leaf;
use crate::sector::Sector;

/// Handle to a node of a [`SelectionTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// One lock for one whole tree.
pub type SharedTree<K, I> = Arc<Mutex<SelectionTree<K, I>>>;

pub(crate) struct Node<K, I> {
    pub(crate) parent: Option<NodeId>,
    /// Client key under which the parent holds this node.
    pub(crate) key: Option<K>,
    pub(crate) wakeup: WakeupCache,
    pub(crate) kind: NodeKind<K, I>,
}

pub(crate) enum NodeKind<K, I> {
    Leaf(Leaf<I>),
    Sector(Sector<K>),
}

impl<K: Hash + Eq, I: Schedulable> NodeKind<K, I> {
    fn len(&self) -> usize {
        match self {
            NodeKind::Leaf(leaf) => leaf.len(),
            NodeKind::Sector(sector) => sector.len(),
        }
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Slot<K, I> {
    generation: u32,
    node: Option<Node<K, I>>,
}

pub struct SelectionTree<K, I> {
    slots: Vec<Slot<K, I>>,
    free: Vec<u32>,
    live: usize,
    pub(crate) config: SelectorConfig,
}

impl<K, I> SelectionTree<K, I> {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            config: config.normalized(),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    /// Number of live nodes, roots included.
    pub fn node_count(&self) -> usize {
        self.live
    }

    pub fn into_shared(self) -> SharedTree<K, I> {
        Arc::new(Mutex::new(self))
    }
}

impl<K, I> Default for SelectionTree<K, I> {
    fn default() -> Self {
        Self::new(SelectorConfig::default())
    }
}

impl<K, I> SelectionTree<K, I>
where
    K: Hash + Eq + Clone + fmt::Debug,
    I: Schedulable,
{
    // ---------------------------------------------------------------------
    // Arena
    // ---------------------------------------------------------------------

    fn alloc(&mut self, node: Node<K, I>) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            node: Some(node),
        });
        NodeId::new(index, 0)
    }

    fn release(&mut self, id: NodeId) -> Result<Node<K, I>, TreeError> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .ok_or(TreeError::UnknownNode(id))?;
        let node = slot.node.take().ok_or(TreeError::UnknownNode(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Ok(node)
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<&Node<K, I>, TreeError> {
        self.slots
            .get(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_ref())
            .ok_or(TreeError::UnknownNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node<K, I>, TreeError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.node.as_mut())
            .ok_or(TreeError::UnknownNode(id))
    }

    fn leaf(&self, id: NodeId) -> Result<&Leaf<I>, TreeError> {
        match &self.node(id)?.kind {
            NodeKind::Leaf(leaf) => Ok(leaf),
            NodeKind::Sector(_) => Err(TreeError::NotALeaf(id)),
        }
    }

    fn leaf_mut(&mut self, id: NodeId) -> Result<&mut Leaf<I>, TreeError> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Leaf(leaf) => Ok(leaf),
            NodeKind::Sector(_) => Err(TreeError::NotALeaf(id)),
        }
    }

    pub(crate) fn sector(&self, id: NodeId) -> Result<&Sector<K>, TreeError> {
        match &self.node(id)?.kind {
            NodeKind::Sector(sector) => Ok(sector),
            NodeKind::Leaf(_) => Err(TreeError::NotASector(id)),
        }
    }

    fn sector_mut(&mut self, id: NodeId) -> Result<&mut Sector<K>, TreeError> {
        match &mut self.node_mut(id)?.kind {
            NodeKind::Sector(sector) => Ok(sector),
            NodeKind::Leaf(_) => Err(TreeError::NotASector(id)),
        }
    }

    fn empty_leaf(&self) -> NodeKind<K, I> {
        NodeKind::Leaf(Leaf::new(
            self.config.block_size,
            self.config.min_block_size,
        ))
    }

    fn root(kind: NodeKind<K, I>) -> Node<K, I> {
        Node {
            parent: None,
            key: None,
            wakeup: WakeupCache::default(),
            kind,
        }
    }

    // ---------------------------------------------------------------------
    // Construction
    // ---------------------------------------------------------------------

    /// Create a parentless sector, e.g. one per priority class.
    pub fn new_sector(&mut self) -> NodeId {
        self.alloc(Self::root(NodeKind::Sector(Sector::new())))
    }

    /// Create a parentless leaf.
    pub fn new_leaf(&mut self) -> NodeId {
        let kind = self.empty_leaf();
        self.alloc(Self::root(kind))
    }

    fn create_child(
        &mut self,
        sector: NodeId,
        key: K,
        kind: NodeKind<K, I>,
    ) -> Result<NodeId, TreeError> {
        // Validate before allocating so a bad parent id leaks nothing.
        if self.sector(sector)?.get(&key).is_some() {
            return Err(TreeError::DuplicateClient(format!("{key:?}")));
        }
        let child = self.alloc(Node {
            parent: Some(sector),
            key: Some(key.clone()),
            wakeup: WakeupCache::default(),
            kind,
        });
        self.sector_mut(sector)?.insert(key, child);
        trace!(parent = %sector, child = %child, "created child container");
        Ok(child)
    }

    /// Child of `sector` registered under `key`, if any.
    pub fn child(&self, sector: NodeId, key: &K) -> Result<Option<NodeId>, TreeError> {
        Ok(self.sector(sector)?.get(key))
    }

    /// Get or create a nested sector under `key`.
    pub fn child_sector(&mut self, sector: NodeId, key: K) -> Result<NodeId, TreeError> {
        match self.sector(sector)?.get(&key) {
            Some(existing) => {
                self.sector(existing)?;
                Ok(existing)
            }
            None => self.create_child(sector, key, NodeKind::Sector(Sector::new())),
        }
    }

    /// Attach a parentless node (built with [`Self::new_leaf`] or
    /// [`Self::new_sector`]) under `key`. A leaf must already hold items.
    pub fn attach(&mut self, sector: NodeId, key: K, child: NodeId) -> Result<(), TreeError> {
        if let Some(parent) = self.node(child)?.parent {
            debug!(child = %child, parent = %parent, "refusing to attach a parented node");
            return Err(TreeError::AlreadyAttached(child));
        }
        if self.sector(sector)?.get(&key).is_some() {
            return Err(TreeError::DuplicateClient(format!("{key:?}")));
        }
        // An attached leaf is never empty; an empty sector is tolerated.
        if let NodeKind::Leaf(leaf) = &self.node(child)?.kind {
            if leaf.is_empty() {
                return Err(TreeError::EmptyLeaf(child));
            }
        }

        let mut cursor = Some(sector);
        while let Some(n) = cursor {
            if n == child {
                return Err(TreeError::Invariant(format!(
                    "attaching {child} under {sector} would create a cycle"
                )));
            }
            cursor = self.node(n)?.parent;
        }

        let node = self.node_mut(child)?;
        node.parent = Some(sector);
        node.key = Some(key.clone());
        let has_work = !node.kind.is_empty();

        self.sector_mut(sector)?.insert(key, child);
        if has_work {
            self.clear_wakeup_time(sector)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Adding and removing
    // ---------------------------------------------------------------------

    /// Queue `item` for client `key` under `sector`, creating the client's leaf
    /// on first use.
    ///
    /// `Ok(false)` means the item was refused: it reports itself finished, or it
    /// is already queued on that leaf.
    pub fn add(&mut self, sector: NodeId, key: K, item: Arc<I>) -> Result<bool, TreeError> {
        let (leaf, created) = match self.sector(sector)?.get(&key) {
            Some(existing) => {
                self.leaf(existing)?;
                (existing, false)
            }
            None => {
                let kind = self.empty_leaf();
                (self.create_child(sector, key, kind)?, true)
            }
        };

        let result = self.add_to_leaf(leaf, item);
        if created && !matches!(result, Ok(true)) {
            // Release only the leaf made for this call; `sector` belongs to the caller.
            self.detach(sector, leaf)?;
        }
        result
    }

    /// Queue `item` directly on a leaf.
    pub fn add_to_leaf(&mut self, leaf: NodeId, item: Arc<I>) -> Result<bool, TreeError> {
        let added = self.leaf_mut(leaf)?.add(leaf, item)?;
        if added {
            // New work may be ready sooner than any cached bound above it.
            self.clear_wakeup_time(leaf)?;
        }
        Ok(added)
    }

    /// Take `item` out of whichever leaf holds it. `Ok(false)` if it is not queued.
    pub fn remove(&mut self, item: &Arc<I>) -> Result<bool, TreeError> {
        let Some(owner) = item.owner_slot().get() else {
            return Ok(false);
        };
        let leaf = self.leaf_mut(owner).map_err(|e| {
            warn!(owner = %owner, error = %e, "item owner slot points at a missing leaf");
            TreeError::Invariant(format!("item owner {owner} is not a live leaf: {e}"))
        })?;
        leaf.remove(owner, item)?;
        self.prune_if_empty(owner)?;
        Ok(true)
    }

    /// Drop client `key` from `sector` with everything queued under it.
    /// Returns the number of items released.
    pub fn remove_client(&mut self, sector: NodeId, key: &K) -> Result<usize, TreeError> {
        let Some(child) = self.sector_mut(sector)?.remove(key) else {
            return Ok(0);
        };
        let released = self.release_subtree(child)?;
        debug!(sector = %sector, client = ?key, released, "client removed");
        self.prune_if_empty(sector)?;
        Ok(released)
    }

    /// Clear the cached wakeup above `item` after its readiness moved earlier
    /// without it being re-added. `Ok(false)` if it is not queued.
    pub fn wake(&mut self, item: &Arc<I>) -> Result<bool, TreeError> {
        match item.owner_slot().get() {
            Some(owner) => {
                self.clear_wakeup_time(owner)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn release_subtree(&mut self, id: NodeId) -> Result<usize, TreeError> {
        let node = self.release(id)?;
        match node.kind {
            NodeKind::Leaf(mut leaf) => Ok(leaf.drain()),
            NodeKind::Sector(sector) => {
                let mut released = 0;
                for child in sector.ids() {
                    released += self.release_subtree(child)?;
                }
                Ok(released)
            }
        }
    }

    /// Unlink an empty `child` from `parent` and free it.
    pub(crate) fn detach(&mut self, parent: NodeId, child: NodeId) -> Result<(), TreeError> {
        let key = self
            .node(child)?
            .key
            .clone()
            .ok_or_else(|| TreeError::Invariant(format!("child {child} has no client key")))?;

        match self.sector_mut(parent)?.remove(&key) {
            Some(found) if found == child => {}
            other => {
                warn!(parent = %parent, child = %child, ?other, "parent index disagrees with child");
                return Err(TreeError::Invariant(format!(
                    "sector {parent} maps {key:?} to {other:?}, expected {child}"
                )));
            }
        }

        let released = self.release_subtree(child)?;
        debug!(parent = %parent, child = %child, released, "detached empty container");
        Ok(())
    }

    /// Detach `id` and then each ancestor that became empty, stopping at the
    /// first non-empty node or at a root.
    pub(crate) fn prune_if_empty(&mut self, mut id: NodeId) -> Result<(), TreeError> {
        loop {
            let node = self.node(id)?;
            if !node.kind.is_empty() {
                return Ok(());
            }
            let Some(parent) = node.parent else {
                return Ok(());
            };
            self.detach(parent, id)?;
            id = parent;
        }
    }

    // ---------------------------------------------------------------------
    // Selection
    // ---------------------------------------------------------------------

    /// Pick and remove one runnable item from under `node`.
    ///
    /// Every direct child of a sector is equally likely to be probed, however
    /// many items it holds. `Wakeup(t)` means nothing under `node` can run
    /// before `t`; `Empty` means nothing is queued at all.
    #[instrument(level = "debug", target = "selector", skip(self, exclusion, rng))]
    pub fn remove_random<E, R>(
        &mut self,
        node: NodeId,
        exclusion: &E,
        now: Timestamp,
        rng: &mut R,
    ) -> Result<Selection<I>, TreeError>
    where
        E: ExclusionCheck<I> + ?Sized,
        R: Rng + ?Sized,
    {
        let out = self.select_from(node, exclusion, now, rng)?;
        self.prune_if_empty(node)?;
        Ok(out)
    }

    pub(crate) fn select_from<E, R>(
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
        let cached = self.get_wakeup_time(id, now)?;
        if cached > 0 {
            trace!(node = %id, wakeup = cached, "skipping subtree in cooldown");
            return Ok(Selection::Wakeup(cached));
        }

        if let NodeKind::Sector(_) = self.node(id)?.kind {
            return self.sector_remove_random(id, exclusion, now, rng);
        }

        let limit = self.config.exclusion_limit;
        let out = self
            .leaf_mut(id)?
            .remove_random(id, exclusion, now, rng, limit)?;
        if let Selection::Wakeup(wakeup) = out {
            self.settle_wakeup(id, wakeup)?;
        }
        Ok(out)
    }

    // ---------------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------------

    /// Items in a leaf, children in a sector.
    pub fn len(&self, id: NodeId) -> Result<usize, TreeError> {
        Ok(self.node(id)?.kind.len())
    }

    pub fn is_empty(&self, id: NodeId) -> Result<bool, TreeError> {
        Ok(self.node(id)?.kind.is_empty())
    }

    /// Items queued anywhere under `id`.
    pub fn item_count(&self, id: NodeId) -> Result<usize, TreeError> {
        match &self.node(id)?.kind {
            NodeKind::Leaf(leaf) => Ok(leaf.len()),
            NodeKind::Sector(sector) => sector
                .ids()
                .try_fold(0usize, |acc, child| self.item_count(child).map(|n| acc + n)),
        }
    }

    pub fn items(&self, leaf: NodeId) -> Result<Vec<Arc<I>>, TreeError> {
        Ok(self.leaf(leaf)?.iter().cloned().collect())
    }

    pub fn contains(&self, leaf: NodeId, item: &Arc<I>) -> Result<bool, TreeError> {
        Ok(self.leaf(leaf)?.contains(item))
    }

    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>, TreeError> {
        Ok(self.node(id)?.parent)
    }

    pub fn key(&self, id: NodeId) -> Result<Option<&K>, TreeError> {
        Ok(self.node(id)?.key.as_ref())
    }

    /// Client key at position `index` of the sector's flat index.
    pub fn client_at(&self, sector: NodeId, index: usize) -> Result<Option<&K>, TreeError> {
        Ok(self.sector(sector)?.key_at(index))
    }

    pub fn clients(&self, sector: NodeId) -> Result<Vec<K>, TreeError> {
        Ok(self.sector(sector)?.keys().cloned().collect())
    }

    /// Audit the whole arena. Any error means the tree is corrupt.
    pub fn check_invariants(&self) -> Result<(), TreeError> {
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(node) = &slot.node else { continue };
            let id = NodeId::new(index as u32, slot.generation);

            match (node.parent, &node.key) {
                (Some(parent), Some(key)) => {
                    if self.sector(parent)?.get(key) != Some(id) {
                        return Err(TreeError::Invariant(format!(
                            "{id} claims parent {parent} under {key:?}, parent disagrees"
                        )));
                    }
                }
                (None, None) => {}
                _ => {
                    return Err(TreeError::Invariant(format!(
                        "{id} has a parent without a key or a key without a parent"
                    )));
                }
            }

            match &node.kind {
                NodeKind::Leaf(leaf) => {
                    if leaf.is_empty() && node.parent.is_some() {
                        return Err(TreeError::Invariant(format!(
                            "empty leaf {id} still attached"
                        )));
                    }
                    if let Some(bad) = leaf.iter().find(|it| it.owner_slot().get() != Some(id)) {
                        return Err(TreeError::Invariant(format!(
                            "item in leaf {id} has owner {:?}",
                            bad.owner_slot().get()
                        )));
                    }
                }
                NodeKind::Sector(sector) => {
                    for (key, child) in sector.entries() {
                        let c = self.node(child)?;
                        if c.parent != Some(id) || c.key.as_ref() != Some(key) {
                            return Err(TreeError::Invariant(format!(
                                "sector {id} holds {child} under {key:?} but the child disagrees"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
