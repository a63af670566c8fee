//! Tree balancing
//!
//! After an insert or delete the cursor path is handed to
//! [`BtShared::balance`], which walks it from the modified page towards the
//! root. A page that holds cells it could not place, or that has become
//! underfull after a delete, is redistributed together with up to two
//! siblings on each side; the parent then receives new dividers and is
//! looked at next. The root never moves: it grows a level when it
//! overflows and absorbs its only child when it runs out of cells.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::{
    cell_left_child, decode_cell, encode_cell, index_interior_to_leaf, index_leaf_to_interior,
    set_cell_left_child,
};
use super::cursor::Frame;
use super::page::MemPage;
use super::types::{PageKind, PtrmapType, CELL_PTR_SIZE};
use super::BtShared;

/// Progress of a balance pass, for logging
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BalanceState {
    Idle,
    ScanningSiblings,
    Repacking,
    UpdatingParent,
    Recursing,
}

/// Cells assigned to one new page: `start..end` of the gathered list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
}

/// Split cells of the given sizes into the fewest pages of `capacity`
/// bytes. With `promote`, the cell after each page moves up into the parent
/// and belongs to no page.
fn distribute(sizes: &[usize], capacity: usize, promote: bool) -> Result<Vec<Span>> {
    let n = sizes.len();
    let mut spans: Vec<Span> = Vec::new();
    let mut i = 0;
    loop {
        let start = i;
        let mut used = 0;
        while i < n && used + sizes[i] <= capacity {
            used += sizes[i];
            i += 1;
        }
        if i == start && i < n {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("cell of {} bytes larger than a page", sizes[i]),
            ));
        }
        spans.push(Span { start, end: i });
        if i >= n {
            break;
        }
        if promote {
            i += 1;
            if i >= n {
                // Only the promoted cell was left over; promote the one
                // before it instead so the last page is not empty.
                let Some(last) = spans.last_mut() else {
                    return Err(Error::new(ErrorCode::Internal));
                };
                if last.end - last.start < 2 {
                    return Err(Error::with_message(
                        ErrorCode::Internal,
                        "cannot split interior cells without an empty page",
                    ));
                }
                last.end -= 1;
                let start = last.end + 1;
                spans.push(Span { start, end: n });
                break;
            }
        }
    }

    // Even out neighbours, right to left, while that does not make the
    // right page heavier than the left one
    let sum = |span: Span| -> usize { sizes[span.start..span.end].iter().sum() };
    for j in (1..spans.len()).rev() {
        loop {
            let left = spans[j - 1];
            let right = spans[j];
            if left.end - left.start <= 1 {
                break;
            }
            let last = sizes[left.end - 1];
            let incoming = if promote { sizes[left.end] } else { last };
            let r = sum(right) + incoming;
            if r > capacity || r > sum(left) - last {
                break;
            }
            spans[j - 1].end -= 1;
            spans[j].start -= 1;
        }
    }
    Ok(spans)
}

impl BtShared {
    /// Restore the size invariants along `path` after its last page was
    /// modified in memory. Every page it touches is written.
    pub(crate) fn balance(&mut self, path: &mut Vec<Frame>, after_delete: bool) -> Result<()> {
        let mut state = BalanceState::Idle;
        loop {
            let Some(level) = path.len().checked_sub(1) else {
                return Err(Error::with_message(ErrorCode::Internal, "balance on an empty path"));
            };
            let page = &path[level].page;

            if level == 0 {
                if page.has_overflow() {
                    state = BalanceState::Recursing;
                    self.balance_deeper(path)?;
                    continue;
                }
                while !path[0].page.is_leaf() && path[0].page.n_cell() == 0 {
                    if !self.balance_shallower(path)? {
                        break;
                    }
                }
                self.write_page(&path[0].page)?;
                break;
            }

            let needs_balance = page.has_overflow()
                || (after_delete && (page.n_cell() == 0 || page.is_underfull()));
            if !needs_balance {
                self.write_page(page)?;
                break;
            }
            self.balance_nonroot(path, level, &mut state)?;
            path.truncate(level);
            state = BalanceState::Recursing;
        }
        if state != BalanceState::Idle {
            tracing::trace!(?state, "balance finished");
        }
        Ok(())
    }

    /// Move the overflowing root's content into a new child and make the
    /// root an interior page whose only pointer is that child
    fn balance_deeper(&mut self, path: &mut Vec<Frame>) -> Result<()> {
        let child_pgno = self.allocate_page()?;
        let root = &mut path[0].page;
        let kind = root.kind();

        let mut cells = Vec::with_capacity(root.n_cell());
        for i in 0..root.n_cell() {
            cells.push(root.cell_bytes(i)?.to_vec());
        }
        let mut child = MemPage::new_empty(child_pgno, kind, self.limits(child_pgno), self.params)?;
        child.rebuild(kind, &cells, root.header.right_child)?;
        child.overflow = std::mem::take(&mut root.overflow);

        root.reset(PageKind::interior(kind.tree()))?;
        root.set_right_child(child_pgno)?;
        let root_pgno = root.pgno;
        path[0].index = 0;

        self.ptrmap_put(child_pgno, PtrmapType::Btree, root_pgno)?;
        self.set_child_ptrmaps(&child)?;
        tracing::debug!(root = root_pgno, child = child_pgno, "root split, tree grows a level");
        path.insert(1, Frame { page: child, index: 0 });
        Ok(())
    }

    /// Copy the only child of an empty interior root into the root. Returns
    /// false when the child's cells do not fit there.
    fn balance_shallower(&mut self, path: &mut [Frame]) -> Result<bool> {
        let child_pgno = path[0].page.child_pgno(0)?;
        let child = self.load_page(child_pgno)?;
        let cells = child.logical_cells()?;
        let root = &mut path[0].page;
        if !root.fits(&cells, child.kind()) {
            return Ok(false);
        }
        root.rebuild(child.kind(), &cells, child.header.right_child)?;
        self.set_child_ptrmaps(&path[0].page)?;
        self.free_page(child_pgno)?;
        tracing::debug!(root = path[0].page.pgno, child = child_pgno, "root absorbed its child");
        Ok(true)
    }

    /// Redistribute the page at `path[level]` and its siblings
    /// (balance_nonroot). The parent at `level - 1` is updated in memory.
    fn balance_nonroot(&mut self, path: &mut [Frame], level: usize, state: &mut BalanceState) -> Result<()> {
        let params = self.params;
        let (upper, lower) = path.split_at_mut(level);
        let parent_frame = &mut upper[level - 1];
        let current = &lower[0].page;
        let parent = &mut parent_frame.page;
        let child_index = parent_frame.index;

        *state = BalanceState::ScanningSiblings;
        let n_parent = parent.n_cell();
        if child_index > n_parent || parent.has_overflow() {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("page {} is not balanced below parent {}", current.pgno, parent.pgno),
            ));
        }
        let first = child_index.saturating_sub(2);
        let last = (child_index + 2).min(n_parent);
        let kind = current.kind();

        let mut olds = Vec::with_capacity(last - first + 1);
        for i in first..=last {
            let pgno = parent.child_pgno(i)?;
            let page = if i == child_index {
                if pgno != current.pgno {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        format!("parent {} does not point at page {}", parent.pgno, current.pgno),
                    ));
                }
                current.clone()
            } else {
                self.load_page(pgno)?
            };
            if page.kind() != kind {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("sibling {} is {:?}, expected {:?}", pgno, page.kind(), kind),
                ));
            }
            olds.push(page);
        }
        let n_old = olds.len();

        // Gather every cell of the window in key order
        let mut cells: Vec<Vec<u8>> = Vec::new();
        for (i, old) in olds.iter().enumerate() {
            cells.extend(old.logical_cells()?);
            if i + 1 == n_old {
                break;
            }
            let divider = parent.cell_bytes(first + i)?;
            match kind {
                PageKind::TableLeaf => {}
                PageKind::IndexLeaf => cells.push(index_interior_to_leaf(divider, &params)?),
                PageKind::TableInterior | PageKind::IndexInterior => {
                    let mut cell = divider.to_vec();
                    set_cell_left_child(&mut cell, old.child_pgno(old.n_cell())?)?;
                    cells.push(cell);
                }
            }
        }
        let final_right = if kind.is_leaf() {
            None
        } else {
            Some(olds[n_old - 1].child_pgno(olds[n_old - 1].n_cell())?)
        };

        *state = BalanceState::Repacking;
        let sizes: Vec<usize> = cells.iter().map(|c| c.len() + CELL_PTR_SIZE).collect();
        let capacity = params.usable_size as usize - kind.header_size();
        let promote = kind != PageKind::TableLeaf;
        let spans = distribute(&sizes, capacity, promote)?;
        let n_new = spans.len();

        // Allocate everything before rewriting anything
        let mut pgnos: Vec<Pgno> = olds.iter().take(n_new).map(|p| p.pgno).collect();
        while pgnos.len() < n_new {
            pgnos.push(self.allocate_page()?);
        }
        pgnos.sort_unstable();

        let mut news = Vec::with_capacity(n_new);
        let mut dividers = Vec::with_capacity(n_new.saturating_sub(1));
        for (j, span) in spans.iter().enumerate() {
            let pgno = pgnos[j];
            let is_last = j + 1 == n_new;
            let right_child = match final_right {
                None => None,
                Some(_) if !is_last => Some(cell_left_child(&cells[span.end])?),
                Some(right) => Some(right),
            };
            let mut page = MemPage::new_empty(pgno, kind, self.limits(pgno), params)?;
            page.rebuild(kind, &cells[span.start..span.end], right_child)?;
            news.push(page);

            if is_last {
                continue;
            }
            let divider = match kind {
                PageKind::TableLeaf => {
                    let last_cell = &cells[span.end - 1];
                    let rowid = decode_cell(last_cell, 0, kind, &params)?.n_key;
                    encode_cell(PageKind::TableInterior, &params, Some(pgno), rowid, &[])?.bytes
                }
                PageKind::IndexLeaf => index_leaf_to_interior(&cells[span.end], &params, pgno)?,
                PageKind::TableInterior | PageKind::IndexInterior => {
                    let mut cell = cells[span.end].clone();
                    set_cell_left_child(&mut cell, pgno)?;
                    cell
                }
            };
            dividers.push(divider);
        }

        for page in &news {
            self.write_page(page)?;
            self.ptrmap_put(page.pgno, PtrmapType::Btree, parent.pgno)?;
            self.set_child_ptrmaps(page)?;
        }
        for old in &olds {
            if !pgnos.contains(&old.pgno) {
                self.free_page(old.pgno)?;
            }
        }

        *state = BalanceState::UpdatingParent;
        for _ in 1..n_old {
            parent.drop_cell(first)?;
        }
        parent.set_child_pgno(first, pgnos[n_new - 1])?;
        let parent_kind = PageKind::interior(kind.tree());
        for (j, divider) in dividers.into_iter().enumerate() {
            if let Some(ovfl) = decode_cell(&divider, 0, parent_kind, &params)?.overflow_pgno {
                self.ptrmap_put(ovfl, PtrmapType::Overflow1, parent.pgno)?;
            }
            parent.insert_cell(first + j, divider)?;
        }

        tracing::debug!(
            parent = parent.pgno,
            ?kind,
            old = n_old,
            new = n_new,
            cells = cells.len(),
            "balanced siblings"
        );
        Ok(())
    }
}
