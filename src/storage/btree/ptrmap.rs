//! Pointer map, page relocation and incremental vacuum
//!
//! In auto-vacuum databases every page after page 1 has a 5-byte entry
//! `[type u8][parent u32]` on a pointer-map page. Page 2 is the first
//! pointer-map page; each one covers the `usable/5` pages that follow it.
//! The entries let vacuum find and rewrite whatever points at a page it
//! moves.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, write_u32};
use super::page::MemPage;
use super::types::{pending_byte_page, PtrmapType};
use super::BtShared;

/// Pointer-map page holding the entry for `pgno`, 0 for page 1
pub fn ptrmap_pageno(usable_size: u32, page_size: u32, pgno: Pgno) -> Pgno {
    if pgno < 2 {
        return 0;
    }
    let per_page = usable_size / 5 + 1;
    let map = ((pgno - 2) / per_page) * per_page + 2;
    if map == pending_byte_page(page_size) {
        map + 1
    } else {
        map
    }
}

pub fn is_ptrmap_page(usable_size: u32, page_size: u32, pgno: Pgno) -> bool {
    pgno >= 2 && ptrmap_pageno(usable_size, page_size, pgno) == pgno
}

impl BtShared {
    pub(crate) fn is_ptrmap_page(&self, pgno: Pgno) -> bool {
        self.auto_vacuum.is_enabled() && is_ptrmap_page(self.usable_size, self.page_size, pgno)
    }

    fn ptrmap_slot(&self, pgno: Pgno) -> Result<(Pgno, usize)> {
        let map = ptrmap_pageno(self.usable_size, self.page_size, pgno);
        if map == 0 || pgno <= map {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("page {} has no pointer-map entry", pgno),
            ));
        }
        Ok((map, 5 * (pgno - map - 1) as usize))
    }

    /// Record the parent of `pgno` (ptrmapPut). No-op without auto-vacuum.
    pub(crate) fn ptrmap_put(&mut self, pgno: Pgno, ty: PtrmapType, parent: Pgno) -> Result<()> {
        if !self.auto_vacuum.is_enabled() {
            return Ok(());
        }
        let (map, offset) = self.ptrmap_slot(pgno)?;
        let mut data = self.get_page(map)?.data;
        if data[offset] == ty as u8 && read_u32(&data, offset + 1) == Some(parent) {
            return Ok(());
        }
        data[offset] = ty as u8;
        write_u32(&mut data, offset + 1, parent)?;
        self.put_page(map, data)?;
        tracing::trace!(pgno, ?ty, parent, "ptrmap entry");
        Ok(())
    }

    /// Read the entry for `pgno` (ptrmapGet)
    pub(crate) fn ptrmap_get(&mut self, pgno: Pgno) -> Result<(PtrmapType, Pgno)> {
        if !self.auto_vacuum.is_enabled() {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "database has no pointer map",
            ));
        }
        let (map, offset) = self.ptrmap_slot(pgno)?;
        if map > self.page_count() {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("pointer-map page {} beyond end of file", map),
            ));
        }
        let data = self.get_page(map)?.data;
        let ty = PtrmapType::from_u8(data[offset]).ok_or_else(|| {
            Error::with_message(
                ErrorCode::Corrupt,
                format!("page {} has pointer-map type {}", pgno, data[offset]),
            )
        })?;
        let parent = read_u32(&data, offset + 1).unwrap_or(0);
        Ok((ty, parent))
    }

    /// Point the entries of every child and overflow head of `page` at it
    /// (setChildPtrmaps)
    pub(crate) fn set_child_ptrmaps(&mut self, page: &MemPage) -> Result<()> {
        if !self.auto_vacuum.is_enabled() {
            return Ok(());
        }
        for i in 0..page.n_cell() {
            let info = page.cell_info(i)?;
            if let Some(ovfl) = info.overflow_pgno {
                self.ptrmap_put(ovfl, PtrmapType::Overflow1, page.pgno)?;
            }
            if !page.is_leaf() {
                self.ptrmap_put(page.child_pgno(i)?, PtrmapType::Btree, page.pgno)?;
            }
        }
        if !page.is_leaf() {
            self.ptrmap_put(page.child_pgno(page.n_cell())?, PtrmapType::Btree, page.pgno)?;
        }
        Ok(())
    }

    /// Rewrite the reference to `from` held by `parent` (modifyPagePointer)
    fn modify_page_pointer(&mut self, parent: Pgno, from: Pgno, to: Pgno, ty: PtrmapType) -> Result<()> {
        if ty == PtrmapType::Overflow2 {
            let mut data = self.get_page(parent)?.data;
            if read_u32(&data, 0) != Some(from) {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow page {} does not link to {}", parent, from),
                ));
            }
            write_u32(&mut data, 0, to)?;
            return self.put_page(parent, data);
        }

        let mut page = self.load_page(parent)?;
        let mut found = false;
        for i in 0..page.n_cell() {
            if ty == PtrmapType::Overflow1 {
                let info = page.cell_info(i)?;
                if info.overflow_pgno == Some(from) {
                    let at = info.payload_offset + info.n_local as usize;
                    write_u32(&mut page.data, at, to)?;
                    found = true;
                    break;
                }
            } else if !page.is_leaf() && page.child_pgno(i)? == from {
                page.set_child_pgno(i, to)?;
                found = true;
                break;
            }
        }
        if !found && ty == PtrmapType::Btree && !page.is_leaf() && page.header.right_child == Some(from) {
            page.set_right_child(to)?;
            found = true;
        }
        if !found {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("page {} holds no pointer to {}", parent, from),
            ));
        }
        self.write_page(&page)
    }

    /// Move page `from` to the free slot `to` and rewrite every reference
    /// to it (relocatePage). `ty` and `parent` are `from`'s pointer-map entry.
    pub(crate) fn relocate_page(&mut self, from: Pgno, ty: PtrmapType, parent: Pgno, to: Pgno) -> Result<()> {
        if from == to || from < 2 || to < 2 {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("cannot relocate page {} to {}", from, to),
            ));
        }
        let data = self.get_page(from)?.data;
        let next_ovfl = read_u32(&data, 0).unwrap_or(0);
        self.put_page(to, data)?;

        match ty {
            PtrmapType::Btree | PtrmapType::RootPage => {
                let page = self.load_page(to)?;
                self.set_child_ptrmaps(&page)?;
            }
            PtrmapType::Overflow1 | PtrmapType::Overflow2 => {
                if next_ovfl != 0 {
                    self.ptrmap_put(next_ovfl, PtrmapType::Overflow2, to)?;
                }
            }
            PtrmapType::FreePage => {
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    format!("free page {} cannot be relocated", from),
                ));
            }
        }
        if ty != PtrmapType::RootPage {
            self.modify_page_pointer(parent, from, to, ty)?;
        }
        self.ptrmap_put(to, ty, parent)?;
        self.bump_generation();
        tracing::debug!(from, to, ?ty, parent, "relocated page");
        Ok(())
    }

    /// Drop the file to `n_page` pages, then shed any pointer-map or
    /// pending-byte pages left at the end
    fn truncate_file(&mut self, n_page: Pgno) {
        let pending = pending_byte_page(self.page_size);
        let mut n = n_page;
        while n > 1 && (self.is_ptrmap_page(n) || n == pending) {
            n -= 1;
        }
        self.pager.truncate_image(n);
    }

    /// Move the last page of the file into a free slot, or drop it when it
    /// is free itself, and shorten the file (incrVacuumStep). Returns false
    /// when nothing is left to reclaim.
    pub(crate) fn incr_vacuum_step(&mut self) -> Result<bool> {
        if !self.auto_vacuum.is_enabled() || self.freelist_count()? == 0 {
            return Ok(false);
        }
        let last = self.page_count();
        if last <= 2 {
            return Ok(false);
        }
        if self.is_ptrmap_page(last) || last == pending_byte_page(self.page_size) {
            self.truncate_file(last - 1);
            return Ok(true);
        }

        let (ty, parent) = self.ptrmap_get(last)?;
        match ty {
            PtrmapType::FreePage => {
                if !self.remove_free_page(last)? {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        format!("page {} is mapped free but not on the freelist", last),
                    ));
                }
                tracing::debug!(pgno = last, "vacuum dropped free page");
            }
            PtrmapType::RootPage => {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("root page {} follows free pages", last),
                ));
            }
            _ => {
                let to = self.freelist_pages()?.pages().filter(|&p| p < last).min();
                let Some(to) = to else {
                    return Ok(false);
                };
                self.remove_free_page(to)?;
                self.relocate_page(last, ty, parent, to)?;
            }
        }
        self.truncate_file(last - 1);
        self.bump_generation();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoVacuum, BtreeConfig};
    use crate::storage::btree::{Btree, BtreePayload};
    use crate::storage::btree::types::TreeKind;

    #[test]
    fn test_ptrmap_pageno_layout() {
        // 1024-byte pages: 204 entries per map page.
        assert_eq!(ptrmap_pageno(1024, 1024, 1), 0);
        assert_eq!(ptrmap_pageno(1024, 1024, 2), 2);
        assert_eq!(ptrmap_pageno(1024, 1024, 3), 2);
        assert_eq!(ptrmap_pageno(1024, 1024, 206), 2);
        assert_eq!(ptrmap_pageno(1024, 1024, 207), 207);
        assert_eq!(ptrmap_pageno(1024, 1024, 208), 207);
        assert!(is_ptrmap_page(1024, 1024, 207));
        assert!(!is_ptrmap_page(1024, 1024, 208));
        assert!(!is_ptrmap_page(1024, 1024, 1));
    }

    #[test]
    fn test_ptrmap_put_get() {
        let config = BtreeConfig::default()
            .with_page_size(1024)
            .with_auto_vacuum(AutoVacuum::Incremental);
        let bt = Btree::open_memory(config).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        let p = shared.allocate_page().unwrap();
        shared.ptrmap_put(p, PtrmapType::Overflow2, 77).unwrap();
        assert_eq!(shared.ptrmap_get(p).unwrap(), (PtrmapType::Overflow2, 77));
        // Entry bytes sit at 5 * (p - 3) on page 2
        let map = shared.get_page(2).unwrap().data;
        let at = 5 * (p as usize - 3);
        assert_eq!(map[at], PtrmapType::Overflow2 as u8);
        assert_eq!(&map[at + 1..at + 5], &77u32.to_be_bytes());
        assert!(shared.ptrmap_get(2).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_ptrmap_put_is_noop_without_auto_vacuum() {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(1024)).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        let p = shared.allocate_page().unwrap();
        assert_eq!(p, 2);
        shared.ptrmap_put(p, PtrmapType::Btree, 1).unwrap();
        assert!(shared.get_page(2).unwrap().data.iter().all(|&b| b == 0));
        assert_eq!(shared.ptrmap_get(p).unwrap_err().code(), ErrorCode::Misuse);
    }

    #[test]
    fn test_relocate_overflow_page() {
        let config = BtreeConfig::default()
            .with_page_size(512)
            .with_auto_vacuum(AutoVacuum::Incremental);
        let bt = Btree::open_memory(config).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        let payload: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
        cursor.insert(&BtreePayload::row(1, payload.clone())).unwrap();

        {
            let mut shared = bt.lock_shared().unwrap();
            let spare = shared.allocate_page().unwrap();
            let leaf = shared.load_page(root).unwrap();
            let first = leaf.cell_info(0).unwrap().overflow_pgno.unwrap();
            let second = read_u32(&shared.get_page(first).unwrap().data, 0).unwrap();
            let (ty, parent) = shared.ptrmap_get(second).unwrap();
            assert_eq!((ty, parent), (PtrmapType::Overflow2, first));
            shared.relocate_page(second, ty, parent, spare).unwrap();
            assert_eq!(read_u32(&shared.get_page(first).unwrap().data, 0), Some(spare));
            assert_eq!(shared.ptrmap_get(spare).unwrap(), (PtrmapType::Overflow2, first));

            let (ty, parent) = shared.ptrmap_get(first).unwrap();
            assert_eq!((ty, parent), (PtrmapType::Overflow1, root));
            let target = shared.allocate_page().unwrap();
            shared.relocate_page(first, ty, parent, target).unwrap();
            let leaf = shared.load_page(root).unwrap();
            assert_eq!(leaf.cell_info(0).unwrap().overflow_pgno, Some(target));
            assert_eq!(shared.ptrmap_get(spare).unwrap(), (PtrmapType::Overflow2, target));
        }

        cursor.first().unwrap();
        assert_eq!(cursor.payload().unwrap(), payload);
    }

    #[test]
    fn test_incr_vacuum_shrinks_file() {
        let config = BtreeConfig::default()
            .with_page_size(512)
            .with_auto_vacuum(AutoVacuum::Incremental);
        let bt = Btree::open_memory(config).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let mut cursor = bt.cursor(root, true).unwrap();
        for rowid in 1..=200i64 {
            cursor.insert(&BtreePayload::row(rowid, vec![rowid as u8; 60])).unwrap();
        }
        for rowid in 1..=150i64 {
            assert!(cursor.seek_rowid(rowid).unwrap());
            cursor.delete().unwrap();
        }
        bt.commit().unwrap();
        let before = bt.page_count().unwrap();
        let free = bt.freelist_count().unwrap();
        assert!(free > 0);

        while bt.incr_vacuum().unwrap() {}
        assert_eq!(bt.freelist_count().unwrap(), 0);
        assert!(bt.page_count().unwrap() < before);
        let report = bt.integrity_check(&[root], 100).unwrap();
        assert!(report.is_ok, "{:?}", report.errors);

        let keys: Vec<i64> = cursor.iter().map(|row| row.unwrap().0).collect();
        assert_eq!(keys, (151..=200).collect::<Vec<_>>());
    }
}
