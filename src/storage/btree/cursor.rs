//! B-tree cursors
//!
//! A cursor walks one tree. It keeps its own copies of the pages on the
//! path from the root to its position, so every call that reads the tree
//! first checks the shared generation counter: when another cursor (or this
//! one) changed the tree since the path was taken, the cursor re-seeks to
//! the key it remembered.

use std::cmp::Ordering;
use std::sync::{Arc, RwLock, Weak};

use crate::error::{Error, ErrorCode, Result};
use crate::types::{Pgno, RowId};

use super::cell::{decode_cell, encode_cell, index_leaf_to_interior};
use super::page::MemPage;
use super::types::{CursorState, PageKind, PtrmapType, SeekBias, TreeKind, BTCURSOR_MAX_DEPTH};
use super::{BtShared, BtreePayload};

/// Orders the keys of an index tree
pub trait KeyComparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Plain `memcmp` order
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryComparator;

impl KeyComparator for BinaryComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Key to position a cursor on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekKey<'a> {
    Rowid(RowId),
    Key(&'a [u8]),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SavedKey {
    Int(RowId),
    Blob(Vec<u8>),
}

impl SavedKey {
    fn as_seek(&self) -> SeekKey<'_> {
        match self {
            SavedKey::Int(rowid) => SeekKey::Rowid(*rowid),
            SavedKey::Blob(key) => SeekKey::Key(key),
        }
    }
}

/// One level of a cursor path. On an interior page `index` is the child
/// the cursor went down into, or, for index trees, the cell it rests on.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub(crate) page: MemPage,
    pub(crate) index: usize,
}

/// Where `move_to` left the cursor relative to the key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveResult {
    /// The tree has no entries
    Empty,
    Equal,
    /// Cursor entry is greater than the key
    Greater,
    /// Cursor entry is less than the key
    Less,
}

/// Order of the cell at `index` relative to `key`
fn compare_cell(
    sh: &mut BtShared,
    comparator: &dyn KeyComparator,
    page: &MemPage,
    index: usize,
    key: SeekKey<'_>,
) -> Result<Ordering> {
    match key {
        SeekKey::Rowid(rowid) => Ok(page.cell_info(index)?.n_key.cmp(&rowid)),
        SeekKey::Key(key) => {
            let info = page.cell_info(index)?;
            if info.has_overflow() {
                let cell = sh.cell_payload(page, index)?;
                Ok(comparator.compare(&cell, key))
            } else {
                let start = info.payload_offset;
                let local = &page.data[start..start + info.n_local as usize];
                Ok(comparator.compare(local, key))
            }
        }
    }
}

/// A position in one tree
pub struct BtCursor {
    shared: Weak<RwLock<BtShared>>,
    root: Pgno,
    writable: bool,
    tree: TreeKind,
    comparator: Arc<dyn KeyComparator>,
    state: CursorState,
    path: Vec<Frame>,
    /// Set while in `SkipNext`: +1 when the cursor already sits on the entry
    /// `next` should return, -1 when it sits on the one `previous` should
    skip_next: i8,
    saved_key: Option<SavedKey>,
    generation: u64,
}

impl BtCursor {
    pub(crate) fn new(
        shared: Weak<RwLock<BtShared>>,
        root: Pgno,
        writable: bool,
        tree: TreeKind,
        comparator: Arc<dyn KeyComparator>,
    ) -> Self {
        Self {
            shared,
            root,
            writable,
            tree,
            comparator,
            state: CursorState::Invalid,
            path: Vec::with_capacity(BTCURSOR_MAX_DEPTH),
            skip_next: 0,
            saved_key: None,
            generation: 0,
        }
    }

    pub fn root(&self) -> Pgno {
        self.root
    }

    pub fn tree(&self) -> TreeKind {
        self.tree
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Pointing at an entry, with no re-seek pending
    pub fn is_valid(&self) -> bool {
        self.state == CursorState::Valid
    }

    pub fn eof(&self) -> bool {
        self.state == CursorState::Invalid
    }

    fn with_shared<T>(&mut self, f: impl FnOnce(&mut Self, &mut BtShared) -> Result<T>) -> Result<T> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "btree is closed"))?;
        let mut guard = shared
            .write()
            .map_err(|_| Error::with_message(ErrorCode::Internal, "btree lock poisoned"))?;
        f(self, &mut guard)
    }

    // ------------------------------------------------------------------------
    // Path movement
    // ------------------------------------------------------------------------

    fn push_page(&mut self, sh: &mut BtShared, pgno: Pgno) -> Result<()> {
        let page = sh.load_page(pgno)?;
        if page.kind().tree() != self.tree {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("page {} is a {:?} page inside a {:?} tree", pgno, page.kind(), self.tree),
            ));
        }
        self.path.push(Frame { page, index: 0 });
        Ok(())
    }

    fn move_to_root(&mut self, sh: &mut BtShared) -> Result<()> {
        self.path.clear();
        self.push_page(sh, self.root)
    }

    fn move_to_child(&mut self, sh: &mut BtShared, child: Pgno) -> Result<()> {
        if self.path.len() >= BTCURSOR_MAX_DEPTH {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("tree {} deeper than {} levels", self.root, BTCURSOR_MAX_DEPTH),
            ));
        }
        tracing::trace!(root = self.root, child, "descend");
        self.push_page(sh, child)
    }

    fn top(&self) -> Result<&Frame> {
        self.path
            .last()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor not on an entry"))
    }

    fn top_mut(&mut self) -> Result<&mut Frame> {
        self.path
            .last_mut()
            .ok_or_else(|| Error::with_message(ErrorCode::Misuse, "cursor not on an entry"))
    }

    fn check_leaf_not_empty(&self) -> Result<()> {
        let top = self.top()?;
        if top.page.n_cell() == 0 && self.path.len() > 1 {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("empty leaf {} below the root of tree {}", top.page.pgno, self.root),
            ));
        }
        Ok(())
    }

    /// Follow child pointers at the current frame's index down to a leaf
    fn move_to_leftmost(&mut self, sh: &mut BtShared) -> Result<()> {
        loop {
            let top = self.top()?;
            if top.page.is_leaf() {
                return self.check_leaf_not_empty();
            }
            let child = top.page.child_pgno(top.index)?;
            self.move_to_child(sh, child)?;
        }
    }

    fn move_to_rightmost(&mut self, sh: &mut BtShared) -> Result<()> {
        self.descend_rightmost(sh)?;
        self.check_leaf_not_empty()
    }

    /// Like `move_to_rightmost`, but an empty leaf at the bottom is fine
    fn descend_rightmost(&mut self, sh: &mut BtShared) -> Result<()> {
        loop {
            let top = self.top_mut()?;
            let n_cell = top.page.n_cell();
            if top.page.is_leaf() {
                top.index = n_cell.saturating_sub(1);
                return Ok(());
            }
            top.index = n_cell;
            let child = top.page.child_pgno(n_cell)?;
            self.move_to_child(sh, child)?;
        }
    }

    /// Position on `key` or a neighbour of it (moveto)
    fn move_to(&mut self, sh: &mut BtShared, key: SeekKey<'_>) -> Result<MoveResult> {
        self.move_to_root(sh)?;
        let comparator = Arc::clone(&self.comparator);
        loop {
            let top = self.top()?;
            let page = &top.page;
            let n_cell = page.n_cell();

            let mut lo = 0;
            let mut hi = n_cell;
            let mut exact = None;
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match compare_cell(sh, comparator.as_ref(), page, mid, key)? {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Greater => hi = mid,
                    Ordering::Equal => {
                        exact = Some(mid);
                        break;
                    }
                }
            }

            if page.is_leaf() {
                if n_cell == 0 {
                    self.check_leaf_not_empty()?;
                    return Ok(MoveResult::Empty);
                }
                let (index, result) = match exact {
                    Some(i) => (i, MoveResult::Equal),
                    None if lo < n_cell => (lo, MoveResult::Greater),
                    None => (n_cell - 1, MoveResult::Less),
                };
                self.top_mut()?.index = index;
                return Ok(result);
            }

            let child_index = match exact {
                // Index keys live once in the tree; this one lives here
                Some(i) if self.tree == TreeKind::Index => {
                    self.top_mut()?.index = i;
                    return Ok(MoveResult::Equal);
                }
                // A table divider is the largest rowid of its left subtree
                Some(i) => i,
                None => lo,
            };
            let child = page.child_pgno(child_index)?;
            self.top_mut()?.index = child_index;
            self.move_to_child(sh, child)?;
        }
    }

    /// Step to the following entry; false at the end of the tree
    fn step_next(&mut self, sh: &mut BtShared) -> Result<bool> {
        let top = self.top_mut()?;
        if !top.page.is_leaf() {
            // Resting on an interior cell; the next entry starts its right subtree
            top.index += 1;
            let child = top.page.child_pgno(top.index)?;
            self.move_to_child(sh, child)?;
            self.move_to_leftmost(sh)?;
            return Ok(true);
        }
        top.index += 1;
        if top.index < top.page.n_cell() {
            return Ok(true);
        }
        loop {
            if self.path.len() == 1 {
                return Ok(false);
            }
            self.path.pop();
            let tree = self.tree;
            let top = self.top_mut()?;
            if top.index < top.page.n_cell() {
                if tree == TreeKind::Index {
                    return Ok(true);
                }
                top.index += 1;
                let child = top.page.child_pgno(top.index)?;
                self.move_to_child(sh, child)?;
                self.move_to_leftmost(sh)?;
                return Ok(true);
            }
        }
    }

    /// Step to the preceding entry; false at the start of the tree
    fn step_prev(&mut self, sh: &mut BtShared) -> Result<bool> {
        let top = self.top_mut()?;
        if !top.page.is_leaf() {
            let child = top.page.child_pgno(top.index)?;
            self.move_to_child(sh, child)?;
            self.move_to_rightmost(sh)?;
            return Ok(true);
        }
        if top.index > 0 {
            top.index -= 1;
            return Ok(true);
        }
        loop {
            if self.path.len() == 1 {
                return Ok(false);
            }
            self.path.pop();
            let tree = self.tree;
            let top = self.top_mut()?;
            if top.index > 0 {
                top.index -= 1;
                if tree == TreeKind::Index {
                    return Ok(true);
                }
                let child = top.page.child_pgno(top.index)?;
                self.move_to_child(sh, child)?;
                self.move_to_rightmost(sh)?;
                return Ok(true);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Saved position
    // ------------------------------------------------------------------------

    fn current_key(&self, sh: &mut BtShared) -> Result<SavedKey> {
        let top = self.top()?;
        match self.tree {
            TreeKind::Table => Ok(SavedKey::Int(top.page.cell_info(top.index)?.n_key)),
            TreeKind::Index => Ok(SavedKey::Blob(sh.cell_payload(&top.page, top.index)?)),
        }
    }

    /// Record the outcome of a positioning call
    fn settle(&mut self, sh: &mut BtShared, on_entry: bool) -> Result<bool> {
        self.generation = sh.generation();
        self.skip_next = 0;
        if on_entry {
            self.saved_key = Some(self.current_key(sh)?);
            self.state = CursorState::Valid;
        } else {
            self.saved_key = None;
            self.state = CursorState::Invalid;
            self.path.clear();
        }
        Ok(on_entry)
    }

    /// Forget the path and re-seek from the saved key on next use
    fn invalidate_path(&mut self) {
        self.path.clear();
        self.skip_next = 0;
        self.state = if self.saved_key.is_some() {
            CursorState::RequireSeek
        } else {
            CursorState::Invalid
        };
    }

    /// Rebuild the path if the tree changed since it was taken
    fn restore(&mut self, sh: &mut BtShared) -> Result<()> {
        let stale = self.generation != sh.generation();
        match self.state {
            CursorState::Invalid => {
                self.path.clear();
                return Ok(());
            }
            CursorState::Valid | CursorState::SkipNext if !stale => return Ok(()),
            _ => {}
        }
        let Some(saved) = self.saved_key.clone() else {
            self.state = CursorState::Invalid;
            self.path.clear();
            return Ok(());
        };
        let result = self.move_to(sh, saved.as_seek())?;
        self.generation = sh.generation();
        self.skip_next = 0;
        self.state = match result {
            MoveResult::Empty => {
                self.path.clear();
                self.saved_key = None;
                self.state = CursorState::Invalid;
                tracing::trace!(root = self.root, "restore found an empty tree");
                return Ok(());
            }
            MoveResult::Equal => CursorState::Valid,
            MoveResult::Greater => {
                self.skip_next = 1;
                CursorState::SkipNext
            }
            MoveResult::Less => {
                self.skip_next = -1;
                CursorState::SkipNext
            }
        };
        tracing::trace!(root = self.root, state = ?self.state, "cursor restored");
        Ok(())
    }

    /// Restore and require the cursor to sit on an entry. A cursor whose
    /// entry was deleted underneath it only points between entries.
    fn require_entry(&mut self, sh: &mut BtShared) -> Result<()> {
        self.restore(sh)?;
        match self.state {
            CursorState::Valid => Ok(()),
            CursorState::SkipNext => Err(Error::with_message(
                ErrorCode::Misuse,
                "cursor entry was deleted; step before reading",
            )),
            _ => Err(Error::with_message(ErrorCode::Misuse, "cursor not on an entry")),
        }
    }

    // ------------------------------------------------------------------------
    // Positioning
    // ------------------------------------------------------------------------

    /// Move to the smallest entry; false when the tree is empty
    pub fn first(&mut self) -> Result<bool> {
        self.with_shared(|cur, sh| {
            cur.move_to_root(sh)?;
            let found = cur.top()?.page.n_cell() > 0;
            if found {
                cur.move_to_leftmost(sh)?;
            }
            cur.settle(sh, found)
        })
    }

    /// Move to the largest entry; false when the tree is empty
    pub fn last(&mut self) -> Result<bool> {
        self.with_shared(|cur, sh| {
            cur.move_to_root(sh)?;
            let found = cur.top()?.page.n_cell() > 0;
            if found {
                cur.move_to_rightmost(sh)?;
            }
            cur.settle(sh, found)
        })
    }

    /// Advance; false (and the cursor becomes invalid) past the last entry
    pub fn next(&mut self) -> Result<bool> {
        self.with_shared(|cur, sh| {
            cur.restore(sh)?;
            match cur.state {
                CursorState::Invalid => return Ok(false),
                CursorState::SkipNext if cur.skip_next > 0 => return cur.settle(sh, true),
                _ => {}
            }
            let found = cur.step_next(sh)?;
            cur.settle(sh, found)
        })
    }

    /// Step back; false (and the cursor becomes invalid) before the first entry
    pub fn previous(&mut self) -> Result<bool> {
        self.with_shared(|cur, sh| {
            cur.restore(sh)?;
            match cur.state {
                CursorState::Invalid => return Ok(false),
                CursorState::SkipNext if cur.skip_next < 0 => return cur.settle(sh, true),
                _ => {}
            }
            let found = cur.step_prev(sh)?;
            cur.settle(sh, found)
        })
    }

    /// Position on `key` according to `bias`. Returns whether the cursor
    /// landed on an entry; with `SeekBias::Exact` a miss leaves it invalid.
    pub fn seek(&mut self, key: SeekKey<'_>, bias: SeekBias) -> Result<bool> {
        match (self.tree, key) {
            (TreeKind::Table, SeekKey::Rowid(_)) | (TreeKind::Index, SeekKey::Key(_)) => {}
            _ => {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    format!("{:?} key used on a {:?} tree", key, self.tree),
                ))
            }
        }
        self.with_shared(|cur, sh| {
            let result = cur.move_to(sh, key)?;
            tracing::trace!(root = cur.root, ?result, ?bias, "seek");
            let found = match (result, bias) {
                (MoveResult::Empty, _) => false,
                (MoveResult::Equal, _) => true,
                (MoveResult::Greater, SeekBias::Ge) | (MoveResult::Less, SeekBias::Le) => true,
                (MoveResult::Greater, SeekBias::Le) => cur.step_prev(sh)?,
                (MoveResult::Less, SeekBias::Ge) => cur.step_next(sh)?,
                (_, SeekBias::Exact) => false,
            };
            cur.settle(sh, found)
        })
    }

    /// Exact seek on a table tree
    pub fn seek_rowid(&mut self, rowid: RowId) -> Result<bool> {
        self.seek(SeekKey::Rowid(rowid), SeekBias::Exact)
    }

    /// Exact seek on an index tree
    pub fn seek_key(&mut self, key: &[u8]) -> Result<bool> {
        self.seek(SeekKey::Key(key), SeekBias::Exact)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Rowid of the current entry (table trees)
    pub fn integer_key(&mut self) -> Result<RowId> {
        if self.tree != TreeKind::Table {
            return Err(Error::with_message(ErrorCode::Misuse, "index entries have no rowid"));
        }
        self.with_shared(|cur, sh| {
            cur.require_entry(sh)?;
            let top = cur.top()?;
            Ok(top.page.cell_info(top.index)?.n_key)
        })
    }

    /// Key bytes of the current entry (index trees)
    pub fn key(&mut self) -> Result<Vec<u8>> {
        if self.tree != TreeKind::Index {
            return Err(Error::with_message(ErrorCode::Misuse, "table entries are keyed by rowid"));
        }
        self.payload()
    }

    /// Full payload of the current entry: the row for tables, the key for
    /// indexes
    pub fn payload(&mut self) -> Result<Vec<u8>> {
        self.with_shared(|cur, sh| {
            cur.require_entry(sh)?;
            let top = cur.top()?;
            sh.cell_payload(&top.page, top.index)
        })
    }

    pub fn payload_size(&mut self) -> Result<u32> {
        self.with_shared(|cur, sh| {
            cur.require_entry(sh)?;
            let top = cur.top()?;
            Ok(top.page.cell_info(top.index)?.n_payload)
        })
    }

    /// `amount` payload bytes from `offset`; `Range` if that runs past the
    /// end of the payload
    pub fn payload_range(&mut self, offset: usize, amount: usize) -> Result<Vec<u8>> {
        self.with_shared(|cur, sh| {
            cur.require_entry(sh)?;
            let top = cur.top()?;
            sh.payload_range(&top.page, top.index, offset, amount)
        })
    }

    /// Number of entries in the tree. Does not move the cursor.
    pub fn count(&mut self) -> Result<i64> {
        let root = self.root;
        let tree = self.tree;
        self.with_shared(|_, sh| {
            let mut total = 0i64;
            let mut stack = vec![(root, 0usize)];
            while let Some((pgno, depth)) = stack.pop() {
                if depth >= BTCURSOR_MAX_DEPTH {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        format!("tree {} deeper than {} levels", root, BTCURSOR_MAX_DEPTH),
                    ));
                }
                let page = sh.load_page(pgno)?;
                if page.is_leaf() || tree == TreeKind::Index {
                    total += page.n_cell() as i64;
                }
                if !page.is_leaf() {
                    for i in 0..=page.n_cell() {
                        stack.push((page.child_pgno(i)?, depth + 1));
                    }
                }
            }
            Ok(total)
        })
    }

    /// Iterate from the first entry, yielding `(rowid, payload)`. Index
    /// entries report their key length in place of a rowid.
    pub fn iter(&mut self) -> BtCursorIter<'_> {
        BtCursorIter {
            cursor: self,
            started: false,
            done: false,
        }
    }

    // ------------------------------------------------------------------------
    // Modification
    // ------------------------------------------------------------------------

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Error::with_message(ErrorCode::ReadOnly, "cursor opened read-only"));
        }
        Ok(())
    }

    /// Insert an entry, replacing any entry with the same key. Afterwards
    /// the cursor points at the new entry.
    pub fn insert(&mut self, payload: &BtreePayload) -> Result<()> {
        self.check_writable()?;
        let (key, body) = match self.tree {
            TreeKind::Table => (
                SavedKey::Int(payload.n_key),
                payload.data.clone().unwrap_or_default(),
            ),
            TreeKind::Index => {
                let key = payload.key.clone().ok_or_else(|| {
                    Error::with_message(ErrorCode::Misuse, "index insert without a key")
                })?;
                (SavedKey::Blob(key.clone()), key)
            }
        };
        self.with_shared(|cur, sh| {
            let result = sh.with_savepoint(|sh| cur.insert_entry(sh, &key, &body));
            if result.is_ok() {
                cur.saved_key = Some(key);
            }
            cur.generation = sh.generation();
            cur.invalidate_path();
            result
        })
    }

    fn insert_entry(&mut self, sh: &mut BtShared, key: &SavedKey, body: &[u8]) -> Result<()> {
        let root = self.root;
        let result = self.move_to(sh, key.as_seek())?;
        let params = *sh.params();
        let top = self.top_mut()?;
        let kind = top.page.kind();
        let mut index = top.index;
        let mut left_child = None;
        match result {
            MoveResult::Equal => {
                let info = top.page.cell_info(index)?;
                sh.clear_cell(&info)?;
                left_child = info.left_child;
                top.page.drop_cell(index)?;
            }
            MoveResult::Less => index += 1,
            MoveResult::Greater | MoveResult::Empty => {}
        }
        let int_key = match key {
            SavedKey::Int(rowid) => *rowid,
            SavedKey::Blob(key) => key.len() as i64,
        };
        let mut cell = encode_cell(kind, &params, left_child, int_key, body)?;
        sh.spill_cell(&mut cell, body, top.page.pgno)?;
        top.page.insert_cell(index, cell.bytes)?;
        top.index = index;
        tracing::trace!(root, pgno = top.page.pgno, index, "insert");
        sh.balance(&mut self.path, false)?;
        sh.bump_generation();
        Ok(())
    }

    /// Delete the current entry. Afterwards `next` returns the entry that
    /// followed it and `previous` the one before it.
    pub fn delete(&mut self) -> Result<()> {
        self.check_writable()?;
        self.with_shared(|cur, sh| {
            cur.restore(sh)?;
            if cur.state != CursorState::Valid {
                return Err(Error::with_message(ErrorCode::Misuse, "cursor not on an entry"));
            }
            let result = sh.with_savepoint(|sh| cur.delete_entry(sh));
            cur.generation = sh.generation();
            cur.invalidate_path();
            result
        })
    }

    fn delete_entry(&mut self, sh: &mut BtShared) -> Result<()> {
        let root = self.root;
        let params = *sh.params();
        let depth = self.path.len() - 1;
        let top = self.top_mut()?;
        let index = top.index;
        let info = top.page.cell_info(index)?;

        if top.page.is_leaf() {
            sh.clear_cell(&info)?;
            top.page.drop_cell(index)?;
            tracing::trace!(root, pgno = top.page.pgno, index, "delete");
            sh.balance(&mut self.path, true)?;
            sh.bump_generation();
            return Ok(());
        }

        // An index key on an interior page is replaced by its predecessor,
        // the last key of the rightmost leaf of its left subtree.
        let left = info
            .left_child
            .ok_or_else(|| Error::with_message(ErrorCode::Corrupt, "interior cell without child"))?;
        self.move_to_child(sh, left)?;
        self.move_to_rightmost(sh)?;
        let leaf = self.top_mut()?;
        let last = leaf
            .page
            .n_cell()
            .checked_sub(1)
            .ok_or_else(|| Error::with_message(ErrorCode::Corrupt, "empty leaf under interior cell"))?;
        let pred = leaf.page.cell_bytes(last)?.to_vec();
        let pred_key = sh.cell_payload(&leaf.page, last)?;
        // The predecessor's overflow chain moves up with it
        leaf.page.drop_cell(last)?;
        sh.write_page(&leaf.page)?;

        self.path.truncate(depth + 1);
        let parent = self.top_mut()?;
        sh.clear_cell(&info)?;
        parent.page.drop_cell(index)?;
        let cell = index_leaf_to_interior(&pred, &params, left)?;
        if let Some(ovfl) = decode_cell(&cell, 0, PageKind::IndexInterior, &params)?.overflow_pgno {
            sh.ptrmap_put(ovfl, PtrmapType::Overflow1, parent.page.pgno)?;
        }
        parent.page.insert_cell(index, cell)?;
        parent.index = index;
        tracing::trace!(root, pgno = parent.page.pgno, index, "delete interior entry");
        sh.balance(&mut self.path, false)?;

        // The leaf that gave up the predecessor may now be underfull
        let found = self.move_to(sh, SeekKey::Key(&pred_key))?;
        let top = self.top()?;
        if found != MoveResult::Equal || top.page.is_leaf() {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                "promoted index key not found on an interior page",
            ));
        }
        let child = top.page.child_pgno(top.index)?;
        self.move_to_child(sh, child)?;
        self.descend_rightmost(sh)?;
        sh.balance(&mut self.path, true)?;
        sh.bump_generation();
        Ok(())
    }
}

/// Iterator over the entries of a tree, see [`BtCursor::iter`]
pub struct BtCursorIter<'a> {
    cursor: &'a mut BtCursor,
    started: bool,
    done: bool,
}

impl Iterator for BtCursorIter<'_> {
    type Item = Result<(RowId, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let moved = if self.started {
            self.cursor.next()
        } else {
            self.started = true;
            self.cursor.first()
        };
        let entry = match moved {
            Ok(true) => self.cursor.with_shared(|cur, sh| {
                let top = cur.top()?;
                let info = top.page.cell_info(top.index)?;
                Ok((info.n_key, sh.cell_payload(&top.page, top.index)?))
            }),
            Ok(false) => {
                self.done = true;
                return None;
            }
            Err(err) => Err(err),
        };
        if entry.is_err() {
            self.done = true;
        }
        Some(entry)
    }
}
