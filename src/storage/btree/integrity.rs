//! Integrity check
//!
//! Walks the given trees and the freelist, marking every page it reaches.
//! Problems are collected as messages rather than returned as errors so
//! that one pass reports as much as it can.

use crate::error::Result;
use crate::types::Pgno;
use crate::util::bitvec::BitVec;

use super::encoding::read_u32;
use super::page::MemPage;
use super::types::{
    pending_byte_page, PtrmapType, TreeKind, BTCURSOR_MAX_DEPTH, CELL_PTR_SIZE, HDR_LARGEST_ROOT,
};
use super::BtShared;

/// Outcome of [`Btree::integrity_check`](super::Btree::integrity_check)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityCheckResult {
    pub errors: Vec<String>,
    pub pages_checked: u32,
    pub is_ok: bool,
}

struct IntegrityCheckState {
    page_refs: BitVec,
    max_err: usize,
    errors: Vec<String>,
    pages_checked: u32,
    page_count: Pgno,
}

impl IntegrityCheckState {
    fn add_error(&mut self, message: String) {
        if self.should_stop() {
            return;
        }
        self.errors.push(message);
    }

    fn should_stop(&self) -> bool {
        self.errors.len() >= self.max_err
    }

    /// Record a reference to `pgno`; false if it cannot be used
    fn mark(&mut self, pgno: Pgno, what: &str) -> bool {
        if pgno == 0 || pgno > self.page_count {
            self.add_error(format!("{} {} out of range", what, pgno));
            return false;
        }
        match self.page_refs.test_and_set(pgno as usize) {
            Some(false) => {
                self.pages_checked = self.pages_checked.saturating_add(1);
                true
            }
            _ => {
                self.add_error(format!("{} {} referenced multiple times", what, pgno));
                false
            }
        }
    }

    fn into_result(self) -> IntegrityCheckResult {
        IntegrityCheckResult {
            is_ok: self.errors.is_empty(),
            errors: self.errors,
            pages_checked: self.pages_checked,
        }
    }
}

/// Key of a cell for order checks; index keys compare bytewise
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum CellKey {
    Int(i64),
    Blob(Vec<u8>),
}

/// Keys a subtree may hold: above `lower`, and up to `upper` (inclusive for
/// tables, exclusive for indexes)
#[derive(Clone, Debug, Default)]
struct KeyRange {
    lower: Option<CellKey>,
    upper: Option<CellKey>,
}

impl KeyRange {
    fn contains(&self, key: &CellKey, tree: TreeKind) -> bool {
        if self.lower.as_ref().is_some_and(|lower| key <= lower) {
            return false;
        }
        match (&self.upper, tree) {
            (Some(upper), TreeKind::Table) => key <= upper,
            (Some(upper), TreeKind::Index) => key < upper,
            (None, _) => true,
        }
    }
}

impl BtShared {
    pub(crate) fn integrity_check(&mut self, roots: &[Pgno], max_errors: usize) -> Result<IntegrityCheckResult> {
        let page_count = self.page_count();
        let mut state = IntegrityCheckState {
            page_refs: BitVec::new(page_count as usize + 1),
            max_err: if max_errors == 0 { usize::MAX } else { max_errors },
            errors: Vec::new(),
            pages_checked: 0,
            page_count,
        };

        let auto_vacuum = self.auto_vacuum.is_enabled();
        let pending = pending_byte_page(self.page_size);
        if auto_vacuum {
            for pgno in 2..=page_count {
                if self.is_ptrmap_page(pgno) {
                    state.page_refs.set(pgno as usize, true);
                }
            }
        }
        if pending <= page_count {
            state.page_refs.set(pending as usize, true);
        }

        let mut roots_to_check = roots.to_vec();
        if !roots_to_check.contains(&1) {
            roots_to_check.insert(0, 1);
        }
        for root in roots_to_check {
            if state.should_stop() {
                break;
            }
            if root == 0 || root > page_count {
                state.add_error(format!("Root page {} out of range", root));
                continue;
            }
            let tree = match self.load_page(root) {
                Ok(page) => page.kind().tree(),
                Err(err) => {
                    state.add_error(format!("Page {}: {}", root, err));
                    continue;
                }
            };
            self.check_tree_page(&mut state, root, None, 1, tree, KeyRange::default())?;
        }

        self.check_freelist(&mut state)?;

        if auto_vacuum {
            let largest = self.header_u32(HDR_LARGEST_ROOT)?;
            for &root in roots {
                if root > largest {
                    state.add_error(format!(
                        "Root page {} above largest root page {}",
                        root, largest
                    ));
                }
            }
        }

        for pgno in 1..=page_count {
            if state.should_stop() {
                break;
            }
            if !state.page_refs.get(pgno as usize) {
                state.add_error(format!("Page {} is never used", pgno));
            }
        }

        let result = state.into_result();
        if !result.is_ok {
            tracing::warn!(errors = result.errors.len(), "integrity check found problems");
        }
        Ok(result)
    }

    fn check_ptrmap_entry(
        &mut self,
        state: &mut IntegrityCheckState,
        pgno: Pgno,
        expected: (PtrmapType, Pgno),
    ) {
        if !self.auto_vacuum.is_enabled() || pgno == 1 {
            return;
        }
        match self.ptrmap_get(pgno) {
            Ok(found) if found == expected => {}
            Ok((ty, parent)) => state.add_error(format!(
                "Page {}: pointer map says {:?} of {}, expected {:?} of {}",
                pgno, ty, parent, expected.0, expected.1
            )),
            Err(err) => state.add_error(format!("Page {}: pointer map unreadable: {}", pgno, err)),
        }
    }

    /// Check one page and everything below it. Returns the depth of its
    /// leaves, or `None` when the subtree could not be walked.
    fn check_tree_page(
        &mut self,
        state: &mut IntegrityCheckState,
        pgno: Pgno,
        parent: Option<Pgno>,
        depth: usize,
        tree: TreeKind,
        range: KeyRange,
    ) -> Result<Option<usize>> {
        if state.should_stop() {
            return Ok(None);
        }
        if depth > BTCURSOR_MAX_DEPTH {
            state.add_error(format!("Page {}: tree deeper than {} levels", pgno, BTCURSOR_MAX_DEPTH));
            return Ok(None);
        }
        if self.is_ptrmap_page(pgno) {
            state.add_error(format!("Page {}: pointer-map page used in a tree", pgno));
            return Ok(None);
        }
        if !state.mark(pgno, "Page") {
            return Ok(None);
        }
        let expected = match parent {
            None => (PtrmapType::RootPage, 0),
            Some(parent) => (PtrmapType::Btree, parent),
        };
        self.check_ptrmap_entry(state, pgno, expected);

        let page = match self.load_page(pgno) {
            Ok(page) => page,
            Err(err) => {
                state.add_error(format!("Page {}: {}", pgno, err));
                return Ok(None);
            }
        };
        if page.kind().tree() != tree {
            state.add_error(format!("Page {}: {:?} page inside a {:?} tree", pgno, page.kind(), tree));
            return Ok(None);
        }
        if parent.is_some() && page.n_cell() == 0 {
            state.add_error(format!("Page {}: non-root page has no cells", pgno));
        }
        check_page_layout(state, &page);

        let mut keys: Vec<Option<CellKey>> = Vec::with_capacity(page.n_cell());
        let mut prev: Option<CellKey> = None;
        for i in 0..page.n_cell() {
            if state.should_stop() {
                return Ok(None);
            }
            let info = match page.cell_info(i) {
                Ok(info) => info,
                Err(err) => {
                    state.add_error(format!("Page {}: cell {}: {}", pgno, i, err));
                    return Ok(None);
                }
            };
            let mut payload_ok = true;
            if let Some(first) = info.overflow_pgno {
                let n_pages = self.params.overflow_pages(info.n_payload, info.n_local);
                payload_ok = self.check_overflow_chain(state, first, pgno, n_pages)?;
            }
            let key = match tree {
                TreeKind::Table => Some(CellKey::Int(info.n_key)),
                TreeKind::Index if payload_ok => self.cell_payload(&page, i).ok().map(CellKey::Blob),
                TreeKind::Index => None,
            };
            if let Some(key) = &key {
                if prev.as_ref().is_some_and(|prev| key <= prev) {
                    state.add_error(format!("Page {}: cell {} out of order", pgno, i));
                } else if !range.contains(key, tree) {
                    state.add_error(format!("Page {}: cell {} key outside parent bounds", pgno, i));
                }
                prev = Some(key.clone());
            }
            keys.push(key);
        }

        if page.is_leaf() {
            return Ok(Some(depth));
        }

        let mut leaf_depth: Option<usize> = None;
        let n_cell = page.n_cell();
        for i in 0..=n_cell {
            if state.should_stop() {
                return Ok(None);
            }
            let child = match page.child_pgno(i) {
                Ok(child) => child,
                Err(err) => {
                    state.add_error(format!("Page {}: child {}: {}", pgno, i, err));
                    continue;
                }
            };
            let child_range = KeyRange {
                lower: if i == 0 { range.lower.clone() } else { keys[i - 1].clone() },
                upper: if i == n_cell { range.upper.clone() } else { keys[i].clone() },
            };
            let found = self.check_tree_page(state, child, Some(pgno), depth + 1, tree, child_range)?;
            match (leaf_depth, found) {
                (_, None) => {}
                (None, Some(d)) => leaf_depth = Some(d),
                (Some(d0), Some(d)) if d0 != d => {
                    state.add_error(format!("Page {}: leaves at depths {} and {}", pgno, d0, d));
                }
                _ => {}
            }
        }
        Ok(leaf_depth)
    }

    /// Walk an overflow chain of `n_pages` pages owned by a cell on `owner`.
    /// Returns false if the chain is broken.
    fn check_overflow_chain(
        &mut self,
        state: &mut IntegrityCheckState,
        first: Pgno,
        owner: Pgno,
        n_pages: usize,
    ) -> Result<bool> {
        let mut pgno = first;
        let mut prev = owner;
        for i in 0..n_pages {
            if state.should_stop() {
                return Ok(false);
            }
            if self.is_ptrmap_page(pgno) {
                state.add_error(format!("Overflow page {} is a pointer-map page", pgno));
                return Ok(false);
            }
            if !state.mark(pgno, "Overflow page") {
                return Ok(false);
            }
            let expected = if i == 0 {
                (PtrmapType::Overflow1, owner)
            } else {
                (PtrmapType::Overflow2, prev)
            };
            self.check_ptrmap_entry(state, pgno, expected);

            let next = match self.get_page(pgno) {
                Ok(page) => read_u32(&page.data, 0).unwrap_or(0),
                Err(err) => {
                    state.add_error(format!("Overflow page {}: {}", pgno, err));
                    return Ok(false);
                }
            };
            let is_last = i + 1 == n_pages;
            if is_last && next != 0 {
                state.add_error(format!("Overflow chain from {} too long", first));
                return Ok(false);
            }
            if !is_last && next == 0 {
                state.add_error(format!(
                    "Overflow chain from {} too short: {} of {} pages",
                    first,
                    i + 1,
                    n_pages
                ));
                return Ok(false);
            }
            prev = pgno;
            pgno = next;
        }
        Ok(true)
    }

    fn check_freelist(&mut self, state: &mut IntegrityCheckState) -> Result<()> {
        let walk = match self.freelist_pages() {
            Ok(walk) => walk,
            Err(err) => {
                state.add_error(format!("Freelist: {}", err));
                return Ok(());
            }
        };
        for pgno in walk.pages() {
            if state.should_stop() {
                return Ok(());
            }
            if self.is_ptrmap_page(pgno) {
                state.add_error(format!("Freelist page {} is a pointer-map page", pgno));
                continue;
            }
            if state.mark(pgno, "Freelist page") {
                self.check_ptrmap_entry(state, pgno, (PtrmapType::FreePage, 0));
            }
        }
        let expected = self.freelist_count()?;
        if walk.len() != expected as usize {
            state.add_error(format!(
                "Freelist holds {} pages but the header says {}",
                walk.len(),
                expected
            ));
        }
        Ok(())
    }
}

/// Cells and freeblocks must not overlap, and together with the free space
/// they must account for the whole content area
fn check_page_layout(state: &mut IntegrityCheckState, page: &MemPage) {
    let pgno = page.pgno;
    let usable = page.limits.usable_end();
    let ptrs = match page.cell_ptrs() {
        Ok(ptrs) => ptrs,
        Err(err) => {
            state.add_error(format!("Page {}: {}", pgno, err));
            return;
        }
    };
    let mut spans = Vec::with_capacity(ptrs.len());
    let mut cell_bytes = 0;
    for (i, ptr) in ptrs.into_iter().enumerate() {
        match page.cell_info(i) {
            Ok(info) => {
                spans.push((ptr, info.n_size, "cell"));
                cell_bytes += info.n_size;
            }
            Err(_) => {
                state.add_error(format!("Page {}: cell {} unreadable", pgno, i));
                return;
            }
        }
    }
    match page.free_blocks() {
        Ok(blocks) => spans.extend(blocks.into_iter().map(|(at, size)| (at, size, "freeblock"))),
        Err(err) => {
            state.add_error(format!("Page {}: {}", pgno, err));
            return;
        }
    }
    spans.sort_unstable();

    let mut end = page.header.content_start;
    for &(at, size, what) in &spans {
        if at < end {
            state.add_error(format!("Page {}: {} at {} overlaps earlier content", pgno, what, at));
            return;
        }
        end = at + size;
    }
    if end > usable {
        state.add_error(format!("Page {}: content runs past the usable area", pgno));
        return;
    }

    let area = usable - page.cell_ptr_start();
    let accounted = cell_bytes + page.n_free + page.n_cell() * CELL_PTR_SIZE;
    if accounted != area {
        state.add_error(format!(
            "Page {}: {} bytes accounted for in a {} byte area",
            pgno, accounted, area
        ));
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{AutoVacuum, BtreeConfig};
    use crate::storage::btree::encoding::write_u32;
    use crate::storage::btree::types::{TreeKind, HDR_FREE_COUNT};
    use crate::storage::btree::{Btree, BtreePayload};
    use crate::types::Pgno;

    fn populated(config: BtreeConfig) -> (Btree, Pgno) {
        let bt = Btree::open_memory(config).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        for rowid in 0..150 {
            let len = if rowid % 10 == 0 { 1200 } else { 50 };
            cursor.insert(&BtreePayload::row(rowid, vec![rowid as u8; len])).unwrap();
        }
        for rowid in (0..150).step_by(4) {
            assert!(cursor.seek_rowid(rowid).unwrap());
            cursor.delete().unwrap();
        }
        (bt, root)
    }

    #[test]
    fn test_integrity_check_clean_tree() {
        let (bt, root) = populated(BtreeConfig::default().with_page_size(512));
        let report = bt.integrity_check(&[root], 0).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);
        assert_eq!(report.pages_checked, bt.page_count().unwrap());
    }

    #[test]
    fn test_integrity_check_clean_auto_vacuum() {
        let config = BtreeConfig::default()
            .with_page_size(512)
            .with_auto_vacuum(AutoVacuum::Incremental);
        let (bt, root) = populated(config);
        let report = bt.integrity_check(&[root], 0).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);
    }

    #[test]
    fn test_integrity_check_reports_unreferenced_page() {
        let (bt, _) = populated(BtreeConfig::default().with_page_size(512));
        // Without the table root its pages look leaked
        let report = bt.integrity_check(&[], 0).unwrap();
        assert!(!report.is_ok);
        assert!(report.errors.iter().any(|e| e.contains("never used")));
    }

    #[test]
    fn test_integrity_check_reports_bad_free_count() {
        let (bt, root) = populated(BtreeConfig::default().with_page_size(512));
        {
            let mut shared = bt.lock_shared().unwrap();
            let mut page1 = shared.get_page(1).unwrap().data;
            write_u32(&mut page1, HDR_FREE_COUNT, 9999).unwrap();
            shared.put_page(1, page1).unwrap();
        }
        let report = bt.integrity_check(&[root], 0).unwrap();
        assert!(report.errors.iter().any(|e| e.contains("header says 9999")), "{:?}", report.errors);
    }

    #[test]
    fn test_integrity_check_reports_out_of_order_keys() {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        for rowid in 1..=3 {
            cursor.insert(&BtreePayload::row(rowid, b"abc".to_vec())).unwrap();
        }
        {
            let mut shared = bt.lock_shared().unwrap();
            let mut leaf = shared.load_page(root).unwrap();
            // Swap the first two cell pointers
            let at = leaf.cell_ptr_start();
            let first = [leaf.data[at], leaf.data[at + 1]];
            leaf.data.copy_within(at + 2..at + 4, at);
            leaf.data[at + 2..at + 4].copy_from_slice(&first);
            shared.put_page(root, leaf.data).unwrap();
        }
        let report = bt.integrity_check(&[root], 0).unwrap();
        assert!(report.errors.iter().any(|e| e.contains("out of order")), "{:?}", report.errors);
    }

    #[test]
    fn test_integrity_check_error_limit() {
        let (bt, _) = populated(BtreeConfig::default().with_page_size(512));
        let report = bt.integrity_check(&[], 2).unwrap();
        assert_eq!(report.errors.len(), 2);
    }
}
