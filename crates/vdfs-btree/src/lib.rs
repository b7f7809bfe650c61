#![forbid(unsafe_code)]
//! Keyed, variable-length-record B+tree over fixed-size bnodes.
//!
//! Every tree lives in its own logical page space: bnode `n` occupies pages
//! `n * node_pages .. (n + 1) * node_pages`, and node 0 is the head (root
//! pointer, height, used-bnode bitmap). Pages are mapped to physical blocks
//! by a [`DirtyBlockSink`]; the tree never chooses a physical location
//! itself.
//!
//! Leaves hold `(key, value)` records in comparator order and are linked to
//! their siblings so that [`BTree::next_record`] can walk across node
//! boundaries. Index records carry the first key of their child's range and
//! the child id as a little-endian `u32`.
//!
//! Insertion splits full nodes bottom-up and grows a new root when the old
//! one splits. Removal never merges or rebalances; empty leaves stay linked
//! and are skipped during iteration.
//!
//! The engine takes no locks of its own beyond its node cache. Callers wrap
//! a tree in a reader/writer lock: lookups need `&BTree`, mutations
//! `&mut BTree`.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};
use vdfs_block::{BlockDevice, DirtyBlockSink};
use vdfs_error::{Fault, Result};
use vdfs_ondisk::bnode::{Bnode, HeadNode, check_node, record_footprint, record_space};
use vdfs_types::{BlockNumber, BnodeId, ParseError, Subsystem, Version};

/// Total order over raw keys.
pub type KeyCmp = fn(&[u8], &[u8]) -> Ordering;

/// Upper bound on cached clean nodes kept across a flush.
const CLEAN_CACHE_LIMIT: usize = 4096;

/// Size and capacity of one tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeGeometry {
    pub block_size: usize,
    /// Blocks per bnode.
    pub node_pages: u32,
    /// Number of bnode ids, head included.
    pub capacity: u32,
}

impl TreeGeometry {
    #[must_use]
    pub fn node_size(&self) -> usize {
        self.block_size * self.node_pages as usize
    }

    /// Logical pages the tree can address.
    #[must_use]
    pub fn pages(&self) -> u64 {
        u64::from(self.capacity) * u64::from(self.node_pages)
    }

    /// Largest on-disk footprint a single record may have. Keeping every
    /// record under half a node guarantees any overfull node splits into
    /// two halves that fit.
    #[must_use]
    pub fn max_record_footprint(&self) -> usize {
        record_space(self.node_size()) / 2
    }
}

/// Snapshot of one record and its position.
///
/// The position is a hint: if the tree changed since the handle was taken,
/// [`BTree::next_record`] re-seeks by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHandle {
    pub node: BnodeId,
    pub pos: usize,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Shape of a tree as seen by [`BTree::check`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub height: u16,
    pub nodes: u32,
    pub leaves: u32,
    pub empty_leaves: u32,
    pub records: u64,
}

pub struct BTree {
    subsystem: Subsystem,
    cmp: KeyCmp,
    geometry: TreeGeometry,
    dev: Arc<dyn BlockDevice>,
    sink: Arc<dyn DirtyBlockSink>,
    head: HeadNode,
    nodes: Mutex<HashMap<BnodeId, Arc<Bnode>>>,
    /// Nodes modified in the current generation and where they go.
    dirty: BTreeMap<BnodeId, Vec<BlockNumber>>,
}

impl fmt::Debug for BTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BTree")
            .field("subsystem", &self.subsystem)
            .field("geometry", &self.geometry)
            .field("root", &self.head.root)
            .field("height", &self.head.height)
            .field("dirty", &self.dirty.len())
            .finish_non_exhaustive()
    }
}

fn child_id(value: &[u8]) -> Result<BnodeId> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| Fault::inconsistent("index record value is not a bnode id"))?;
    Ok(BnodeId(u32::from_le_bytes(bytes)))
}

fn encode_child(id: BnodeId) -> Vec<u8> {
    id.0.to_le_bytes().to_vec()
}

fn encode_fault(subsystem: Subsystem, id: BnodeId, err: &ParseError) -> Fault {
    Fault::inconsistent(format!("{subsystem} bnode {id} cannot be encoded: {err}"))
}

/// Split position that leaves both halves within `space`, as balanced by
/// bytes as possible.
fn split_point(records: &[(Vec<u8>, Vec<u8>)], space: usize) -> Option<usize> {
    let sizes: Vec<usize> = records
        .iter()
        .map(|(k, v)| record_footprint(k, v))
        .collect();
    let total: usize = sizes.iter().sum();
    let mut left = 0_usize;
    let mut best: Option<(usize, usize)> = None;
    for (k, size) in sizes.iter().enumerate().take(sizes.len().saturating_sub(1)) {
        left += size;
        let right = total - left;
        if left <= space && right <= space {
            let skew = left.abs_diff(right);
            if best.is_none_or(|(_, s)| skew < s) {
                best = Some((k + 1, skew));
            }
        }
    }
    best.map(|(k, _)| k)
}

impl BTree {
    /// Lay out an empty tree: head plus an empty leaf root. Nothing reaches
    /// the device until [`BTree::flush`].
    pub fn create(
        subsystem: Subsystem,
        cmp: KeyCmp,
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        if geometry.capacity > HeadNode::max_capacity(geometry.node_size()) {
            return Err(Fault::Format(format!(
                "{subsystem} tree capacity {} exceeds head bitmap",
                geometry.capacity
            )));
        }
        let head = HeadNode::new(geometry.capacity)
            .map_err(|e| Fault::Format(format!("{subsystem} tree head: {e}")))?;
        let mut tree = Self {
            subsystem,
            cmp,
            geometry,
            dev,
            sink,
            head,
            nodes: Mutex::new(HashMap::new()),
            dirty: BTreeMap::new(),
        };
        let root = tree.head.alloc().ok_or(Fault::NoSpace)?;
        tree.head.root = root;
        tree.head.height = 1;
        tree.sink.ensure_capacity(2 * u64::from(geometry.node_pages))?;
        tree.store(Bnode::new_leaf(root))?;
        tree.mark_dirty(BnodeId::HEAD)?;
        debug!(subsystem = %subsystem, root = root.0, "btree_create");
        Ok(tree)
    }

    /// Open an existing tree by reading its head node.
    pub fn open(
        subsystem: Subsystem,
        cmp: KeyCmp,
        geometry: TreeGeometry,
        dev: Arc<dyn BlockDevice>,
        sink: Arc<dyn DirtyBlockSink>,
    ) -> Result<Self> {
        let mut tree = Self {
            subsystem,
            cmp,
            geometry,
            dev,
            sink,
            head: HeadNode::new(geometry.capacity.max(2))
                .map_err(|e| Fault::Format(format!("{subsystem} tree head: {e}")))?,
            nodes: Mutex::new(HashMap::new()),
            dirty: BTreeMap::new(),
        };
        let (image, first) = tree.read_image(BnodeId::HEAD)?;
        check_node(&image).map_err(|e| tree.corrupt(first, BnodeId::HEAD, &e))?;
        let head = HeadNode::decode(&image).map_err(|e| tree.corrupt(first, BnodeId::HEAD, &e))?;
        if head.capacity != geometry.capacity {
            return Err(Fault::corrupt(
                first.0,
                format!(
                    "{subsystem} tree head capacity {} does not match superblock {}",
                    head.capacity, geometry.capacity
                ),
            ));
        }
        tree.head = head;
        trace!(
            subsystem = %subsystem,
            root = tree.head.root.0,
            height = tree.head.height,
            "btree_open"
        );
        Ok(tree)
    }

    #[must_use]
    pub fn subsystem(&self) -> Subsystem {
        self.subsystem
    }

    #[must_use]
    pub fn geometry(&self) -> TreeGeometry {
        self.geometry
    }

    #[must_use]
    pub fn height(&self) -> u16 {
        self.head.height
    }

    #[must_use]
    pub fn comparator(&self) -> KeyCmp {
        self.cmp
    }

    /// Bnode ids still available.
    #[must_use]
    pub fn free_nodes(&self) -> u32 {
        self.head.free_count()
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    // ── Node access ─────────────────────────────────────────────────────

    fn first_page(&self, id: BnodeId) -> u64 {
        u64::from(id.0) * u64::from(self.geometry.node_pages)
    }

    fn corrupt(&self, block: BlockNumber, id: BnodeId, err: &ParseError) -> Fault {
        error!(
            subsystem = %self.subsystem,
            bnode = id.0,
            block = block.0,
            error = %err,
            "bnode_corrupt"
        );
        Fault::corrupt(block.0, format!("{} bnode {id}: {err}", self.subsystem))
    }

    /// Read all pages of a node, returning the image and its first block.
    fn read_image(&self, id: BnodeId) -> Result<(Vec<u8>, BlockNumber)> {
        let first_page = self.first_page(id);
        let mut image = Vec::with_capacity(self.geometry.node_size());
        let mut first_block = BlockNumber(0);
        for page in first_page..first_page + u64::from(self.geometry.node_pages) {
            let Some(block) = self.sink.locate(page)? else {
                return Err(Fault::inconsistent(format!(
                    "{} bnode {id} page {page} is unmapped",
                    self.subsystem
                )));
            };
            if page == first_page {
                first_block = block;
            }
            image.extend_from_slice(self.dev.read_block(block)?.as_slice());
        }
        Ok((image, first_block))
    }

    fn load(&self, id: BnodeId) -> Result<Arc<Bnode>> {
        if let Some(node) = self.nodes.lock().get(&id) {
            return Ok(Arc::clone(node));
        }
        if id == BnodeId::HEAD || !self.head.is_used(id) {
            return Err(Fault::inconsistent(format!(
                "{} bnode {id} referenced but not allocated",
                self.subsystem
            )));
        }
        let (image, first) = self.read_image(id)?;
        check_node(&image).map_err(|e| self.corrupt(first, id, &e))?;
        let node = Bnode::decode(&image).map_err(|e| self.corrupt(first, id, &e))?;
        if node.node_id != id {
            return Err(Fault::corrupt(
                first.0,
                format!(
                    "{} bnode {id} carries node id {}",
                    self.subsystem, node.node_id
                ),
            ));
        }
        trace!(subsystem = %self.subsystem, bnode = id.0, block = first.0, "bnode_load");
        let node = Arc::new(node);
        self.nodes.lock().insert(id, Arc::clone(&node));
        Ok(node)
    }

    /// Relocate every page of `id` through the sink, once per generation.
    fn mark_dirty(&mut self, id: BnodeId) -> Result<()> {
        if self.dirty.contains_key(&id) {
            return Ok(());
        }
        let first_page = self.first_page(id);
        let blocks = (first_page..first_page + u64::from(self.geometry.node_pages))
            .map(|page| self.sink.on_dirty(page))
            .collect::<Result<Vec<_>>>()?;
        trace!(
            subsystem = %self.subsystem,
            bnode = id.0,
            block = blocks.first().map_or(0, |b| b.0),
            "bnode_dirty"
        );
        self.dirty.insert(id, blocks);
        Ok(())
    }

    fn store(&mut self, node: Bnode) -> Result<()> {
        let id = node.node_id;
        self.mark_dirty(id)?;
        self.nodes.get_mut().insert(id, Arc::new(node));
        Ok(())
    }

    /// Pages a single mutation may dirty in the worst case: every node on
    /// the path, a sibling and a new node per level, a new root and the
    /// head.
    fn worst_case_pages(&self) -> u64 {
        let per_level = 3 * u64::from(self.head.height);
        (per_level + 2) * u64::from(self.geometry.node_pages)
    }

    fn child_index(&self, node: &Bnode, key: &[u8]) -> usize {
        node.records
            .partition_point(|(k, _)| (self.cmp)(k, key) != Ordering::Greater)
            .saturating_sub(1)
    }

    /// Walk from the root to the leaf whose range covers `key`.
    fn descend(&self, key: &[u8]) -> Result<Arc<Bnode>> {
        let mut id = self.head.root;
        let mut level = self.head.height.saturating_sub(1);
        loop {
            let node = self.load(id)?;
            if node.level != level {
                return Err(Fault::inconsistent(format!(
                    "{} bnode {id} at level {} where {level} was expected",
                    self.subsystem, node.level
                )));
            }
            if node.is_leaf() {
                return Ok(node);
            }
            if node.records.is_empty() {
                return Err(Fault::inconsistent(format!(
                    "{} index bnode {id} has no records",
                    self.subsystem
                )));
            }
            id = child_id(&node.records[self.child_index(&node, key)].1)?;
            level -= 1;
        }
    }

    fn leftmost_leaf(&self) -> Result<Arc<Bnode>> {
        let mut node = self.load(self.head.root)?;
        while !node.is_leaf() {
            let Some((_, value)) = node.records.first() else {
                return Err(Fault::inconsistent(format!(
                    "{} index bnode {} has no records",
                    self.subsystem, node.node_id
                )));
            };
            node = self.load(child_id(value)?)?;
        }
        Ok(node)
    }

    /// First record at or after `pos` in `node`, following sibling links
    /// past exhausted and empty leaves.
    fn first_from(&self, mut node: Arc<Bnode>, mut pos: usize) -> Result<Option<RecordHandle>> {
        loop {
            if let Some((key, value)) = node.records.get(pos) {
                return Ok(Some(RecordHandle {
                    node: node.node_id,
                    pos,
                    key: key.clone(),
                    value: value.clone(),
                }));
            }
            let Some(next) = node.next else {
                return Ok(None);
            };
            node = self.load(next)?;
            pos = 0;
        }
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// Exact-match lookup.
    pub fn find(&self, key: &[u8]) -> Result<RecordHandle> {
        let leaf = self.descend(key)?;
        match leaf.records.binary_search_by(|(k, _)| (self.cmp)(k, key)) {
            Ok(pos) => Ok(RecordHandle {
                node: leaf.node_id,
                pos,
                key: leaf.records[pos].0.clone(),
                value: leaf.records[pos].1.clone(),
            }),
            Err(_) => Err(Fault::NotFound(format!("{} key", self.subsystem))),
        }
    }

    /// Exact-match lookup for modification.
    ///
    /// The containing node is relocated through the sink before the handle
    /// is returned, so the caller may rewrite the value in place.
    pub fn find_mut(&mut self, key: &[u8]) -> Result<RecordMut<'_>> {
        let handle = self.find(key)?;
        self.sink
            .ensure_capacity(u64::from(self.geometry.node_pages))?;
        self.mark_dirty(handle.node)?;
        Ok(RecordMut { tree: self, handle })
    }

    /// Smallest record whose key is `>= key`.
    pub fn seek(&self, key: &[u8]) -> Result<Option<RecordHandle>> {
        let leaf = self.descend(key)?;
        let pos = leaf
            .records
            .partition_point(|(k, _)| (self.cmp)(k, key) == Ordering::Less);
        self.first_from(leaf, pos)
    }

    /// Smallest record whose key is `> key`.
    pub fn seek_after(&self, key: &[u8]) -> Result<Option<RecordHandle>> {
        let leaf = self.descend(key)?;
        let pos = leaf
            .records
            .partition_point(|(k, _)| (self.cmp)(k, key) != Ordering::Greater);
        self.first_from(leaf, pos)
    }

    /// Smallest record in the tree.
    pub fn first_record(&self) -> Result<Option<RecordHandle>> {
        let leaf = self.leftmost_leaf()?;
        self.first_from(leaf, 0)
    }

    /// The record following `handle` in key order.
    pub fn next_record(&self, handle: &RecordHandle) -> Result<Option<RecordHandle>> {
        if self.head.is_used(handle.node) {
            let node = self.load(handle.node)?;
            let still_there = node
                .records
                .get(handle.pos)
                .is_some_and(|(k, _)| (self.cmp)(k, &handle.key) == Ordering::Equal);
            if still_there {
                return self.first_from(node, handle.pos + 1);
            }
        }
        self.seek_after(&handle.key)
    }

    /// Forward iterator starting at the first record `>= key`.
    pub fn iter_from(&self, key: &[u8]) -> Result<Records<'_>> {
        Ok(Records {
            tree: self,
            next: self.seek(key)?,
            failed: false,
        })
    }

    /// Forward iterator over the whole tree.
    pub fn iter(&self) -> Result<Records<'_>> {
        Ok(Records {
            tree: self,
            next: self.first_record()?,
            failed: false,
        })
    }

    // ── Mutation ────────────────────────────────────────────────────────

    fn check_record_size(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let max = self.geometry.max_record_footprint();
        let index_footprint = record_footprint(key, &[0; 4]);
        if record_footprint(key, value) > max || index_footprint > max {
            return Err(Fault::InvalidArgument(format!(
                "{} record of {} bytes exceeds limit {max}",
                self.subsystem,
                record_footprint(key, value)
            )));
        }
        Ok(())
    }

    fn reserve_for_mutation(&self, new_nodes: u32) -> Result<()> {
        if self.head.free_count() < new_nodes {
            return Err(Fault::NoSpace);
        }
        self.sink.ensure_capacity(self.worst_case_pages())
    }

    /// Insert a new record. Fails with [`Fault::DuplicateKey`] when the
    /// comparator reports an equal key.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.check_record_size(&key, &value)?;
        self.reserve_for_mutation(u32::from(self.head.height) + 1)?;

        let root = self.head.root;
        let Some((separator, right)) = self.insert_descend(root, key, value)? else {
            return Ok(());
        };
        self.grow_root(separator, right)
    }

    fn insert_descend(
        &mut self,
        id: BnodeId,
        key: Vec<u8>,
        value: Vec<u8>,
    ) -> Result<Option<(Vec<u8>, BnodeId)>> {
        let mut node = (*self.load(id)?).clone();
        if node.is_leaf() {
            match node.records.binary_search_by(|(k, _)| (self.cmp)(k, &key)) {
                Ok(_) => return Err(Fault::DuplicateKey),
                Err(pos) => node.records.insert(pos, (key, value)),
            }
            return self.store_or_split(node);
        }

        if node.records.is_empty() {
            return Err(Fault::inconsistent(format!(
                "{} index bnode {id} has no records",
                self.subsystem
            )));
        }
        let pos = self.child_index(&node, &key);
        let child = child_id(&node.records[pos].1)?;
        // Keep the first separator a lower bound of everything in child 0.
        let lowered = pos == 0 && (self.cmp)(&key, &node.records[0].0) == Ordering::Less;
        if lowered {
            node.records[0].0.clone_from(&key);
        }
        match self.insert_descend(child, key, value)? {
            Some((separator, right)) => {
                node.records
                    .insert(pos + 1, (separator, encode_child(right)));
            }
            None if !lowered => return Ok(None),
            None => {}
        }
        self.store_or_split(node)
    }

    fn store_or_split(&mut self, mut node: Bnode) -> Result<Option<(Vec<u8>, BnodeId)>> {
        let node_size = self.geometry.node_size();
        if node.fits(node_size) {
            self.store(node)?;
            return Ok(None);
        }
        let Some(mid) = split_point(&node.records, record_space(node_size)) else {
            return Err(Fault::inconsistent(format!(
                "{} bnode {} cannot be split",
                self.subsystem, node.node_id
            )));
        };
        let old_next = node.next.map(|id| self.load(id)).transpose()?;
        let right_id = self.head.alloc().ok_or(Fault::NoSpace)?;

        let right = Bnode {
            kind: node.kind,
            level: node.level,
            node_id: right_id,
            prev: Some(node.node_id),
            next: node.next,
            records: node.records.split_off(mid),
        };
        node.next = Some(right_id);
        if let Some(next) = old_next {
            let mut next = (*next).clone();
            next.prev = Some(right_id);
            self.store(next)?;
        }
        let separator = right.records[0].0.clone();
        debug!(
            subsystem = %self.subsystem,
            old_node = node.node_id.0,
            new_node = right_id.0,
            level = node.level,
            left_records = node.records.len(),
            right_records = right.records.len(),
            "bnode_split"
        );
        self.store(node)?;
        self.store(right)?;
        self.mark_dirty(BnodeId::HEAD)?;
        Ok(Some((separator, right_id)))
    }

    fn grow_root(&mut self, separator: Vec<u8>, right: BnodeId) -> Result<()> {
        let old_root = self.head.root;
        let left_first = self
            .load(old_root)?
            .records
            .first()
            .map(|(k, _)| k.clone())
            .ok_or_else(|| Fault::inconsistent("split left an empty root half"))?;
        let new_root = self.head.alloc().ok_or(Fault::NoSpace)?;
        let mut root = Bnode::new_index(new_root, self.head.height);
        root.records = vec![
            (left_first, encode_child(old_root)),
            (separator, encode_child(right)),
        ];
        self.head.root = new_root;
        self.head.height += 1;
        self.store(root)?;
        self.mark_dirty(BnodeId::HEAD)?;
        debug!(
            subsystem = %self.subsystem,
            root = new_root.0,
            height = self.head.height,
            "btree_grow"
        );
        Ok(())
    }

    /// Remove the record matching `key`, returning its value. Underfull
    /// nodes are left as they are.
    pub fn remove(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let leaf = self.descend(key)?;
        let Ok(pos) = leaf.records.binary_search_by(|(k, _)| (self.cmp)(k, key)) else {
            return Err(Fault::NotFound(format!("{} key", self.subsystem)));
        };
        self.sink
            .ensure_capacity(u64::from(self.geometry.node_pages))?;
        let mut node = (*leaf).clone();
        let (_, value) = node.records.remove(pos);
        trace!(
            subsystem = %self.subsystem,
            bnode = node.node_id.0,
            remaining = node.records.len(),
            "btree_remove"
        );
        self.store(node)?;
        Ok(value)
    }

    /// Replace the value of an existing record.
    ///
    /// Same-size or shrinking values are rewritten in place; a value that no
    /// longer fits its node is moved with a remove and reinsert.
    pub fn update(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.check_record_size(key, &value)?;
        let leaf = self.descend(key)?;
        let Ok(pos) = leaf.records.binary_search_by(|(k, _)| (self.cmp)(k, key)) else {
            return Err(Fault::NotFound(format!("{} key", self.subsystem)));
        };
        let mut node = (*leaf).clone();
        node.records[pos].1 = value;
        if node.fits(self.geometry.node_size()) {
            self.sink
                .ensure_capacity(u64::from(self.geometry.node_pages))?;
            return self.store(node);
        }
        self.reserve_for_mutation(u32::from(self.head.height) + 1)?;
        let stored_key = node.records[pos].0.clone();
        let value = std::mem::take(&mut node.records[pos].1);
        self.remove(key)?;
        self.insert(stored_key, value)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Write every node modified in this generation to the block the sink
    /// assigned it, stamped with `version`. Returns the number of nodes
    /// written.
    pub fn flush(&mut self, version: Version) -> Result<usize> {
        let node_size = self.geometry.node_size();
        let block_size = self.geometry.block_size;
        let nodes = self.nodes.get_mut();
        for (id, blocks) in &self.dirty {
            let image = if *id == BnodeId::HEAD {
                self.head
                    .encode(node_size, version)
                    .map_err(|e| encode_fault(self.subsystem, *id, &e))?
            } else {
                let Some(node) = nodes.get(id) else {
                    return Err(Fault::inconsistent(format!(
                        "{} dirty bnode {id} missing from cache",
                        self.subsystem
                    )));
                };
                node.encode(node_size, version)
                    .map_err(|e| encode_fault(self.subsystem, *id, &e))?
            };
            for (chunk, block) in image.chunks(block_size).zip(blocks) {
                self.dev.write_block(*block, chunk)?;
            }
        }
        let written = self.dirty.len();
        self.dirty.clear();
        if nodes.len() > CLEAN_CACHE_LIMIT {
            nodes.clear();
        }
        debug!(
            subsystem = %self.subsystem,
            nodes = written,
            version = %version,
            "btree_flush"
        );
        Ok(written)
    }

    // ── Verification ────────────────────────────────────────────────────

    /// Walk the whole tree and verify ordering, levels, separators and the
    /// leaf sibling chain.
    pub fn check(&self) -> Result<TreeStats> {
        let mut stats = TreeStats {
            height: self.head.height,
            ..TreeStats::default()
        };
        let mut leaves = Vec::new();
        self.check_subtree(
            self.head.root,
            self.head.height.saturating_sub(1),
            None,
            &mut stats,
            &mut leaves,
        )?;

        for pair in leaves.windows(2) {
            let left = self.load(pair[0])?;
            if left.next != Some(pair[1]) {
                return Err(Fault::inconsistent(format!(
                    "{} leaf {} does not link to {}",
                    self.subsystem, pair[0], pair[1]
                )));
            }
        }
        let mut previous: Option<Vec<u8>> = None;
        let mut walker = self.first_record()?;
        while let Some(record) = walker {
            if let Some(prev) = &previous {
                if (self.cmp)(prev, &record.key) != Ordering::Less {
                    return Err(Fault::inconsistent(format!(
                        "{} records out of order in bnode {}",
                        self.subsystem, record.node
                    )));
                }
            }
            previous = Some(record.key.clone());
            walker = self.next_record(&record)?;
        }
        Ok(stats)
    }

    fn check_subtree(
        &self,
        id: BnodeId,
        level: u16,
        lower_bound: Option<&[u8]>,
        stats: &mut TreeStats,
        leaves: &mut Vec<BnodeId>,
    ) -> Result<()> {
        let node = self.load(id)?;
        stats.nodes += 1;
        if node.level != level {
            return Err(Fault::inconsistent(format!(
                "{} bnode {id} level {} expected {level}",
                self.subsystem, node.level
            )));
        }
        for pair in node.records.windows(2) {
            if (self.cmp)(&pair[0].0, &pair[1].0) != Ordering::Less {
                return Err(Fault::inconsistent(format!(
                    "{} bnode {id} records out of order",
                    self.subsystem
                )));
            }
        }
        if let (Some(bound), Some((first, _))) = (lower_bound, node.records.first()) {
            if (self.cmp)(bound, first) == Ordering::Greater {
                return Err(Fault::inconsistent(format!(
                    "{} bnode {id} holds a key below its separator",
                    self.subsystem
                )));
            }
        }
        if node.is_leaf() {
            stats.leaves += 1;
            stats.records += node.records.len() as u64;
            if node.records.is_empty() {
                stats.empty_leaves += 1;
            }
            leaves.push(id);
            return Ok(());
        }
        if node.records.is_empty() {
            return Err(Fault::inconsistent(format!(
                "{} index bnode {id} has no records",
                self.subsystem
            )));
        }
        for (separator, child) in &node.records {
            self.check_subtree(child_id(child)?, level - 1, Some(separator), stats, leaves)?;
        }
        Ok(())
    }
}

/// Writable view of one record; see [`BTree::find_mut`].
#[derive(Debug)]
pub struct RecordMut<'a> {
    tree: &'a mut BTree,
    handle: RecordHandle,
}

impl RecordMut<'_> {
    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.handle.key
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.handle.value
    }

    /// Replace the record's value. A value of the same length is written
    /// into the already-relocated node without touching its neighbours.
    pub fn set_value(&mut self, value: Vec<u8>) -> Result<()> {
        if value.len() != self.handle.value.len() {
            self.tree.update(&self.handle.key, value.clone())?;
            self.handle = self.tree.find(&self.handle.key)?;
            return Ok(());
        }
        let mut node = (*self.tree.load(self.handle.node)?).clone();
        let Some(record) = node.records.get_mut(self.handle.pos) else {
            return Err(Fault::inconsistent("record moved under a writable handle"));
        };
        record.1.clone_from(&value);
        self.tree.store(node)?;
        self.handle.value = value;
        Ok(())
    }
}

/// Forward record iterator; see [`BTree::iter_from`].
pub struct Records<'a> {
    tree: &'a BTree,
    next: Option<RecordHandle>,
    failed: bool,
}

impl Iterator for Records<'_> {
    type Item = Result<RecordHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let current = self.next.take()?;
        match self.tree.next_record(&current) {
            Ok(next) => self.next = next,
            Err(err) => {
                self.failed = true;
                return Some(Err(err));
            }
        }
        Some(Ok(current))
    }
}
