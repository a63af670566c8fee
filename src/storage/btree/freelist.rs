//! Freelist manager
//!
//! Free pages hang off the file header as a chain of trunk pages. A trunk
//! is `[u32 next trunk][u32 leaf count][u32 leaf pgno]*`; leaves carry no
//! content. Header offset 32 holds the first trunk, 36 the total count.

use std::collections::HashSet;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, write_u32};
use super::types::{pending_byte_page, PtrmapType, HDR_FIRST_TRUNK, HDR_FREE_COUNT};
use super::BtShared;

/// Trunk and leaf pages found by walking the freelist
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FreelistWalk {
    pub trunks: Vec<Pgno>,
    pub leaves: Vec<Pgno>,
}

impl FreelistWalk {
    pub fn len(&self) -> usize {
        self.trunks.len() + self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pages(&self) -> impl Iterator<Item = Pgno> + '_ {
        self.trunks.iter().chain(self.leaves.iter()).copied()
    }
}

fn trunk_leaf_count(data: &[u8], pgno: Pgno, max_read: usize) -> Result<usize> {
    let k = read_u32(data, 4).unwrap_or(0) as usize;
    if k > max_read {
        return Err(Error::with_message(
            ErrorCode::Corrupt,
            format!("freelist trunk {} claims {} leaves", pgno, k),
        ));
    }
    Ok(k)
}

impl BtShared {
    /// Leaves a trunk may hold when written
    fn trunk_write_capacity(&self) -> usize {
        self.usable_size as usize / 4 - 8
    }

    /// Leaves accepted on read
    fn trunk_read_capacity(&self) -> usize {
        (self.usable_size as usize - 8) / 4
    }

    pub(crate) fn freelist_count(&mut self) -> Result<u32> {
        self.header_u32(HDR_FREE_COUNT)
    }

    fn check_free_pgno(&self, pgno: Pgno, what: &str) -> Result<()> {
        if pgno < 2 || pgno > self.page_count() {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("freelist {} {} out of range", what, pgno),
            ));
        }
        Ok(())
    }

    /// Take a page from the freelist or grow the file (allocateBtreePage).
    /// The returned page is zeroed and dirty.
    pub(crate) fn allocate_page(&mut self) -> Result<Pgno> {
        let first_trunk = self.header_u32(HDR_FIRST_TRUNK)?;
        let pgno = if first_trunk != 0 {
            self.check_free_pgno(first_trunk, "trunk")?;
            let free_count = self.header_u32(HDR_FREE_COUNT)?;
            if free_count == 0 {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    "freelist has a trunk but a zero page count",
                ));
            }
            let mut trunk = self.get_page(first_trunk)?.data;
            let k = trunk_leaf_count(&trunk, first_trunk, self.trunk_read_capacity())?;
            let pgno = if k == 0 {
                // The trunk itself is handed out
                let next = read_u32(&trunk, 0).unwrap_or(0);
                self.set_header_u32(HDR_FIRST_TRUNK, next)?;
                first_trunk
            } else {
                let leaf = read_u32(&trunk, 8 + 4 * (k - 1)).unwrap_or(0);
                self.check_free_pgno(leaf, "leaf")?;
                write_u32(&mut trunk, 4, (k - 1) as u32)?;
                self.put_page(first_trunk, trunk)?;
                leaf
            };
            self.set_header_u32(HDR_FREE_COUNT, free_count - 1)?;
            self.put_page(pgno, vec![0u8; self.page_size as usize])?;
            tracing::debug!(pgno, "allocated page from freelist");
            pgno
        } else {
            let pgno = self.extend_file()?;
            tracing::debug!(pgno, "allocated page by extending file");
            pgno
        };
        Ok(pgno)
    }

    /// Grow the file by one usable page, stepping over pointer-map pages
    /// and the pending-byte page
    pub(crate) fn extend_file(&mut self) -> Result<Pgno> {
        let pending = pending_byte_page(self.page_size);
        loop {
            let pgno = self.pager.extend()?;
            if pgno != pending && !self.is_ptrmap_page(pgno) {
                return Ok(pgno);
            }
        }
    }

    /// Return a page to the freelist (freePage2)
    pub(crate) fn free_page(&mut self, pgno: Pgno) -> Result<()> {
        self.check_free_pgno(pgno, "page")?;
        let free_count = self.header_u32(HDR_FREE_COUNT)?;
        let first_trunk = self.header_u32(HDR_FIRST_TRUNK)?;
        self.set_header_u32(HDR_FREE_COUNT, free_count + 1)?;

        if first_trunk != 0 {
            self.check_free_pgno(first_trunk, "trunk")?;
            let mut trunk = self.get_page(first_trunk)?.data;
            let k = trunk_leaf_count(&trunk, first_trunk, self.trunk_read_capacity())?;
            if k < self.trunk_write_capacity() {
                write_u32(&mut trunk, 8 + 4 * k, pgno)?;
                write_u32(&mut trunk, 4, (k + 1) as u32)?;
                self.put_page(first_trunk, trunk)?;
                self.ptrmap_put(pgno, PtrmapType::FreePage, 0)?;
                tracing::debug!(pgno, trunk = first_trunk, "freed page as leaf");
                return Ok(());
            }
        }

        let mut data = vec![0u8; self.page_size as usize];
        write_u32(&mut data, 0, first_trunk)?;
        self.put_page(pgno, data)?;
        self.set_header_u32(HDR_FIRST_TRUNK, pgno)?;
        self.ptrmap_put(pgno, PtrmapType::FreePage, 0)?;
        tracing::debug!(pgno, "freed page as new trunk");
        Ok(())
    }

    /// Walk the whole freelist, bounded by the file size
    pub(crate) fn freelist_pages(&mut self) -> Result<FreelistWalk> {
        let mut walk = FreelistWalk::default();
        let mut seen = HashSet::new();
        let max_read = self.trunk_read_capacity();
        let mut trunk = self.header_u32(HDR_FIRST_TRUNK)?;
        while trunk != 0 {
            self.check_free_pgno(trunk, "trunk")?;
            if !seen.insert(trunk) {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("freelist trunk {} visited twice", trunk),
                ));
            }
            walk.trunks.push(trunk);
            let data = self.get_page(trunk)?.data;
            let k = trunk_leaf_count(&data, trunk, max_read)?;
            for i in 0..k {
                let leaf = read_u32(&data, 8 + 4 * i).unwrap_or(0);
                self.check_free_pgno(leaf, "leaf")?;
                if !seen.insert(leaf) {
                    return Err(Error::with_message(
                        ErrorCode::Corrupt,
                        format!("free page {} listed twice", leaf),
                    ));
                }
                walk.leaves.push(leaf);
            }
            trunk = read_u32(&data, 0).unwrap_or(0);
        }
        Ok(walk)
    }

    /// Take a specific page off the freelist. Returns false when the page
    /// is not free.
    pub(crate) fn remove_free_page(&mut self, target: Pgno) -> Result<bool> {
        let max_read = self.trunk_read_capacity();
        let mut prev_trunk: Option<Pgno> = None;
        let mut trunk = self.header_u32(HDR_FIRST_TRUNK)?;
        let mut steps = 0;
        while trunk != 0 {
            self.check_free_pgno(trunk, "trunk")?;
            steps += 1;
            if steps > self.page_count() {
                return Err(Error::with_message(ErrorCode::Corrupt, "freelist trunk chain loops"));
            }
            let mut data = self.get_page(trunk)?.data;
            let k = trunk_leaf_count(&data, trunk, max_read)?;
            let next = read_u32(&data, 0).unwrap_or(0);

            if trunk == target {
                let replacement = if k == 0 {
                    next
                } else {
                    // The first leaf takes over as trunk with the remaining leaves.
                    let heir = read_u32(&data, 8).unwrap_or(0);
                    self.check_free_pgno(heir, "leaf")?;
                    let mut heir_data = vec![0u8; self.page_size as usize];
                    write_u32(&mut heir_data, 0, next)?;
                    write_u32(&mut heir_data, 4, (k - 1) as u32)?;
                    heir_data[8..8 + 4 * (k - 1)].copy_from_slice(&data[12..12 + 4 * (k - 1)]);
                    self.put_page(heir, heir_data)?;
                    heir
                };
                match prev_trunk {
                    None => self.set_header_u32(HDR_FIRST_TRUNK, replacement)?,
                    Some(prev) => {
                        let mut prev_data = self.get_page(prev)?.data;
                        write_u32(&mut prev_data, 0, replacement)?;
                        self.put_page(prev, prev_data)?;
                    }
                }
                self.decrement_free_count()?;
                return Ok(true);
            }

            for i in 0..k {
                if read_u32(&data, 8 + 4 * i).unwrap_or(0) == target {
                    let last = read_u32(&data, 8 + 4 * (k - 1)).unwrap_or(0);
                    write_u32(&mut data, 8 + 4 * i, last)?;
                    write_u32(&mut data, 4, (k - 1) as u32)?;
                    self.put_page(trunk, data)?;
                    self.decrement_free_count()?;
                    return Ok(true);
                }
            }
            prev_trunk = Some(trunk);
            trunk = next;
        }
        Ok(false)
    }

    fn decrement_free_count(&mut self) -> Result<()> {
        let count = self.header_u32(HDR_FREE_COUNT)?;
        if count == 0 {
            return Err(Error::with_message(ErrorCode::Corrupt, "free page count underflow"));
        }
        self.set_header_u32(HDR_FREE_COUNT, count - 1)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{AutoVacuum, BtreeConfig};
    use crate::storage::btree::types::{PtrmapType, HDR_FIRST_TRUNK};
    use crate::storage::btree::Btree;

    fn small_db() -> Btree {
        Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap()
    }

    #[test]
    fn test_allocate_extends_when_empty() {
        let bt = small_db();
        let mut shared = bt.lock_shared().unwrap();
        assert_eq!(shared.allocate_page().unwrap(), 2);
        assert_eq!(shared.allocate_page().unwrap(), 3);
        assert_eq!(shared.page_count(), 3);
    }

    #[test]
    fn test_free_then_allocate_reuses() {
        let bt = small_db();
        let mut shared = bt.lock_shared().unwrap();
        let pages: Vec<_> = (0..4).map(|_| shared.allocate_page().unwrap()).collect();
        for &p in &pages {
            shared.free_page(p).unwrap();
        }
        assert_eq!(shared.freelist_count().unwrap(), 4);
        // First freed page became the trunk, the rest are its leaves.
        assert_eq!(shared.header_u32(HDR_FIRST_TRUNK).unwrap(), pages[0]);

        let walk = shared.freelist_pages().unwrap();
        assert_eq!(walk.trunks, vec![pages[0]]);
        assert_eq!(walk.leaves, pages[1..].to_vec());

        // Leaves come back last-in first-out, then the trunk itself.
        assert_eq!(shared.allocate_page().unwrap(), pages[3]);
        assert_eq!(shared.allocate_page().unwrap(), pages[2]);
        assert_eq!(shared.allocate_page().unwrap(), pages[1]);
        assert_eq!(shared.allocate_page().unwrap(), pages[0]);
        assert_eq!(shared.freelist_count().unwrap(), 0);
        assert_eq!(shared.header_u32(HDR_FIRST_TRUNK).unwrap(), 0);
    }

    #[test]
    fn test_allocated_page_is_zeroed() {
        let bt = small_db();
        let mut shared = bt.lock_shared().unwrap();
        let p = shared.allocate_page().unwrap();
        let q = shared.allocate_page().unwrap();
        shared.put_page(q, vec![0xee; 512]).unwrap();
        shared.free_page(p).unwrap();
        shared.free_page(q).unwrap();
        assert_eq!(shared.allocate_page().unwrap(), q);
        assert!(shared.get_page(q).unwrap().data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_full_trunk_starts_new_trunk() {
        let bt = small_db();
        let mut shared = bt.lock_shared().unwrap();
        // 512-byte pages hold 512/4 - 8 = 120 leaves per trunk.
        let pages: Vec<_> = (0..123).map(|_| shared.allocate_page().unwrap()).collect();
        for &p in &pages {
            shared.free_page(p).unwrap();
        }
        let walk = shared.freelist_pages().unwrap();
        assert_eq!(walk.trunks, vec![pages[121], pages[0]]);
        assert_eq!(walk.len(), 123);
        assert_eq!(shared.freelist_count().unwrap(), 123);
    }

    #[test]
    fn test_oversized_trunk_count_is_corrupt() {
        let bt = small_db();
        let mut shared = bt.lock_shared().unwrap();
        let p = shared.allocate_page().unwrap();
        shared.allocate_page().unwrap();
        shared.free_page(p).unwrap();
        let mut data = shared.get_page(p).unwrap().data;
        data[4..8].copy_from_slice(&1000u32.to_be_bytes());
        shared.put_page(p, data).unwrap();
        assert!(shared.allocate_page().unwrap_err().is_corrupt());
        assert!(shared.freelist_pages().unwrap_err().is_corrupt());
    }

    #[test]
    fn test_remove_free_page() {
        let bt = small_db();
        let mut shared = bt.lock_shared().unwrap();
        let pages: Vec<_> = (0..5).map(|_| shared.allocate_page().unwrap()).collect();
        for &p in &pages {
            shared.free_page(p).unwrap();
        }
        // A leaf
        assert!(shared.remove_free_page(pages[2]).unwrap());
        // The trunk: its first remaining leaf takes over
        assert!(shared.remove_free_page(pages[0]).unwrap());
        assert!(!shared.remove_free_page(pages[0]).unwrap());

        let walk = shared.freelist_pages().unwrap();
        let mut remaining: Vec<_> = walk.pages().collect();
        remaining.sort_unstable();
        assert_eq!(remaining, vec![pages[1], pages[3], pages[4]]);
        assert_eq!(shared.freelist_count().unwrap(), 3);
    }

    #[test]
    fn test_allocate_skips_ptrmap_page() {
        let config = BtreeConfig::default()
            .with_page_size(512)
            .with_auto_vacuum(AutoVacuum::Incremental);
        let bt = Btree::open_memory(config).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        // Page 2 is the first pointer-map page.
        assert_eq!(shared.allocate_page().unwrap(), 3);
        shared.free_page(3).unwrap();
        assert_eq!(shared.ptrmap_get(3).unwrap(), (PtrmapType::FreePage, 0));
    }
}
