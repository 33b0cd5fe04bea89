/// Item index: a self-balancing ordered tree over the item arena, keyed by
/// on-disk location (§4.3).
///
/// The arena and its tree links live together in [`crate::model::Item`];
/// this module only ever touches items through [`ItemHandle`], never a
/// pointer, so the insert/detach/rebalance algorithm below is a direct
/// translation of a parent/smaller/bigger pointer tree onto arena indices —
/// same shape, no `unsafe`.
use crate::model::{Item, ItemHandle};

/// Arena of items plus the ordered tree over them.
pub struct ItemIndex {
    items: Vec<Item>,
    root: Option<ItemHandle>,
    /// Inserts since the last rebalance; triggers vine-and-compress at 1000,
    /// same threshold as the tree this is grounded on.
    balance_count: u32,
}

const REBALANCE_THRESHOLD: u32 = 1000;

impl ItemIndex {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            root: None,
            balance_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn root(&self) -> Option<ItemHandle> {
        self.root
    }

    pub fn get(&self, handle: ItemHandle) -> &Item {
        &self.items[handle.idx()]
    }

    pub fn get_mut(&mut self, handle: ItemHandle) -> &mut Item {
        &mut self.items[handle.idx()]
    }

    /// Push a new item into the arena and insert it into the ordered tree
    /// keyed by `item.lcn_key()`. Returns the handle the caller should keep.
    pub fn insert(&mut self, item: Item) -> ItemHandle {
        let key = item.lcn_key();
        let handle = ItemHandle::new(self.items.len());
        self.items.push(item);
        self.tree_insert(handle, key);

        self.balance_count += 1;
        if self.balance_count >= REBALANCE_THRESHOLD {
            self.balance_count = 0;
            self.rebalance();
        }
        handle
    }

    /// Locate the insertion point and link `handle` into the tree. Mirrors
    /// the pointer-walk insert this is grounded on: walk down comparing
    /// keys, remember the last node visited and which side we took.
    fn tree_insert(&mut self, handle: ItemHandle, key: u64) {
        let mut here = self.root;
        let mut parent: Option<ItemHandle> = None;
        let mut went_smaller = false;

        while let Some(h) = here {
            parent = Some(h);
            let here_key = self.get(h).lcn_key();
            if here_key > key {
                went_smaller = true;
                here = self.get(h).smaller;
            } else {
                went_smaller = false;
                here = self.get(h).bigger;
            }
        }

        {
            let node = self.get_mut(handle);
            node.tree_parent = parent;
            node.smaller = None;
            node.bigger = None;
        }

        match parent {
            None => self.root = Some(handle),
            Some(p) => {
                if went_smaller {
                    self.get_mut(p).smaller = Some(handle);
                } else {
                    self.get_mut(p).bigger = Some(handle);
                }
            }
        }
    }

    /// Unlink `item` from the tree (§4.3's three deletion cases). The arena
    /// slot is not freed — callers that truly remove an item (rare; most
    /// phases just re-key and re-insert) leave a dangling, unreferenced
    /// slot, matching the "not freed" note on the pointer version.
    pub fn detach(&mut self, handle: ItemHandle) {
        let (parent, smaller, bigger) = {
            let item = self.get(handle);
            (item.tree_parent, item.smaller, item.bigger)
        };

        match bigger {
            None => {
                // Case 1: no bigger child — replace with smaller child.
                self.replace_child(parent, handle, smaller);
                if let Some(s) = smaller {
                    self.get_mut(s).tree_parent = parent;
                }
            }
            Some(big) if self.get(big).smaller.is_none() => {
                // Case 2: bigger child has no smaller child — bigger takes
                // the node's place directly, inheriting its smaller subtree.
                self.replace_child(parent, handle, Some(big));
                self.get_mut(big).tree_parent = parent;
                self.get_mut(big).smaller = smaller;
                if let Some(s) = smaller {
                    self.get_mut(s).tree_parent = Some(big);
                }
            }
            Some(big) => {
                // Case 3: replace with the in-order successor (smallest node
                // in the bigger subtree), detaching it from its own spot
                // first. Since this arm only runs when `big` has a smaller
                // child (the no-smaller-child case is handled above), the
                // successor is always strictly below `big`, never `big`
                // itself.
                let mut succ = big;
                while let Some(s) = self.get(succ).smaller {
                    succ = s;
                }

                let succ_parent = self.get(succ).tree_parent.unwrap();
                let succ_bigger = self.get(succ).bigger;
                self.get_mut(succ_parent).smaller = succ_bigger;
                if let Some(sb) = succ_bigger {
                    self.get_mut(sb).tree_parent = Some(succ_parent);
                }

                self.replace_child(parent, handle, Some(succ));
                self.get_mut(succ).tree_parent = parent;
                self.get_mut(succ).smaller = smaller;
                if let Some(s) = smaller {
                    self.get_mut(s).tree_parent = Some(succ);
                }
                self.get_mut(succ).bigger = Some(big);
                self.get_mut(big).tree_parent = Some(succ);
            }
        }

        let node = self.get_mut(handle);
        node.tree_parent = None;
        node.smaller = None;
        node.bigger = None;
    }

    fn replace_child(
        &mut self,
        parent: Option<ItemHandle>,
        old: ItemHandle,
        new: Option<ItemHandle>,
    ) {
        match parent {
            None => self.root = new,
            Some(p) => {
                if self.get(p).smaller == Some(old) {
                    self.get_mut(p).smaller = new;
                } else {
                    self.get_mut(p).bigger = new;
                }
            }
        }
    }

    /// Smallest-keyed item (first file on the volume by LCN).
    pub fn smallest(&self, top: Option<ItemHandle>) -> Option<ItemHandle> {
        let mut here = top?;
        while let Some(s) = self.get(here).smaller {
            here = s;
        }
        Some(here)
    }

    /// Largest-keyed item (last file on the volume by LCN).
    pub fn biggest(&self, top: Option<ItemHandle>) -> Option<ItemHandle> {
        let mut here = top?;
        while let Some(b) = self.get(here).bigger {
            here = b;
        }
        Some(here)
    }

    /// In-order successor.
    pub fn next(&self, here: ItemHandle) -> Option<ItemHandle> {
        if let Some(b) = self.get(here).bigger {
            return self.smallest(Some(b));
        }
        let mut temp = here;
        let mut parent = self.get(here).tree_parent;
        while let Some(p) = parent {
            if self.get(p).smaller == Some(temp) {
                return Some(p);
            }
            temp = p;
            parent = self.get(p).tree_parent;
        }
        None
    }

    /// In-order predecessor.
    pub fn prev(&self, here: ItemHandle) -> Option<ItemHandle> {
        if let Some(s) = self.get(here).smaller {
            return self.biggest(Some(s));
        }
        let mut temp = here;
        let mut parent = self.get(here).tree_parent;
        while let Some(p) = parent {
            if self.get(p).bigger == Some(temp) {
                return Some(p);
            }
            temp = p;
            parent = self.get(p).tree_parent;
        }
        None
    }

    /// Re-key an item after its fragments have moved, by detaching and
    /// re-inserting under its new LCN. Every move that changes an item's
    /// first-real-fragment LCN must call this to keep the index consistent
    /// (§4.3 "the index is keyed by current location, not original").
    pub fn rekey(&mut self, handle: ItemHandle) {
        self.detach(handle);
        let key = self.get(handle).lcn_key();
        self.tree_insert(handle, key);
    }

    /// Vine-and-compress rebalance (Day-Stout-Warren), run every 1000
    /// inserts. Flattens the tree into a sorted "vine" via repeated
    /// left-rotation, then compresses it back into a balanced shape via
    /// `skip` right-rotations computed from the nearest power of two below
    /// the node count.
    fn rebalance(&mut self) {
        if self.root.is_none() {
            return;
        }

        // Phase 1: convert to a vine (a right-leaning linked list via
        // repeated left-rotation at nodes that still have a bigger child).
        let mut a = self.root;
        let mut c = a;
        let mut count: i64 = 0;

        while let Some(a_handle) = a {
            let a_bigger = self.get(a_handle).bigger;
            match a_bigger {
                None => {
                    count += 1;
                    c = Some(a_handle);
                    a = self.get(a_handle).smaller;
                }
                Some(b_handle) => {
                    if self.root == Some(a_handle) {
                        self.root = Some(b_handle);
                    }
                    let b_smaller = self.get(b_handle).smaller;
                    self.get_mut(a_handle).bigger = b_smaller;
                    if let Some(bs) = b_smaller {
                        self.get_mut(bs).tree_parent = Some(a_handle);
                    }
                    let a_parent = self.get(a_handle).tree_parent;
                    self.get_mut(b_handle).tree_parent = a_parent;
                    if let Some(p) = a_parent {
                        if self.get(p).smaller == Some(a_handle) {
                            self.get_mut(p).smaller = Some(b_handle);
                        } else {
                            self.get_mut(p).bigger = Some(b_handle);
                        }
                    }
                    self.get_mut(b_handle).smaller = Some(a_handle);
                    self.get_mut(a_handle).tree_parent = Some(b_handle);
                    a = Some(b_handle);
                }
            }
        }

        // Phase 2: compress. Compute how many right-rotations to skip on
        // the first pass so the final shape is as close to balanced as a
        // single compress pass allows.
        let mut skip: i64 = 1;
        while skip < count + 2 {
            skip <<= 1;
        }
        skip = count + 1 - (skip >> 1);

        let mut c_cursor = c;
        while let Some(c_handle) = c_cursor {
            if skip <= 0 {
                c_cursor = self.get(c_handle).tree_parent;
            }
            let mut a = c_cursor;
            loop {
                let a_handle = match a {
                    Some(h) => h,
                    None => break,
                };
                let b_handle = a_handle;
                let next_a = self.get(b_handle).tree_parent;
                let a_handle = match next_a {
                    Some(h) => h,
                    None => break,
                };

                // Rotate right at `a_handle`, promoting `b_handle`.
                if self.root == Some(a_handle) {
                    self.root = Some(b_handle);
                }
                let b_bigger = self.get(b_handle).bigger;
                self.get_mut(a_handle).smaller = b_bigger;
                if let Some(bb) = b_bigger {
                    self.get_mut(bb).tree_parent = Some(a_handle);
                }
                let a_parent = self.get(a_handle).tree_parent;
                self.get_mut(b_handle).tree_parent = a_parent;
                if let Some(p) = a_parent {
                    if self.get(p).smaller == Some(a_handle) {
                        self.get_mut(p).smaller = Some(b_handle);
                    } else {
                        self.get_mut(p).bigger = Some(b_handle);
                    }
                }
                self.get_mut(a_handle).tree_parent = Some(b_handle);
                self.get_mut(b_handle).bigger = Some(a_handle);

                a = self.get(b_handle).tree_parent;

                skip -= 1;
                if skip == 0 {
                    break;
                }
            }
        }
    }

    /// In-order iteration from smallest to biggest, for tests and for the
    /// zone calculator's full-volume sweeps.
    pub fn iter_in_order(&self) -> InOrderIter<'_> {
        InOrderIter {
            index: self,
            current: self.smallest(self.root),
        }
    }
}

impl Default for ItemIndex {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InOrderIter<'a> {
    index: &'a ItemIndex,
    current: Option<ItemHandle>,
}

impl<'a> Iterator for InOrderIter<'a> {
    type Item = ItemHandle;

    fn next(&mut self) -> Option<ItemHandle> {
        let here = self.current?;
        self.current = self.index.next(here);
        Some(here)
    }
}
