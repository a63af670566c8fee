//! Overflow chain manager
//!
//! Each overflow page is `[u32 next][usable - 4 payload bytes]`; the last
//! page has next = 0.

use std::collections::HashSet;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::{overflow_page_capacity, CellInfo, EncodedCell};
use super::encoding::read_u32;
use super::page::MemPage;
use super::types::PtrmapType;
use super::BtShared;

impl BtShared {
    /// Write `tail` into a fresh overflow chain and return its first page.
    /// `owner` is the B-tree page holding the cell.
    pub(crate) fn write_overflow_chain(&mut self, tail: &[u8], owner: Pgno) -> Result<Pgno> {
        let cap = overflow_page_capacity(self.usable_size);
        let n_pages = tail.len().div_ceil(cap);
        if n_pages == 0 {
            return Err(Error::with_message(ErrorCode::Internal, "empty overflow chain"));
        }

        let mut pages = Vec::with_capacity(n_pages);
        for _ in 0..n_pages {
            pages.push(self.allocate_page()?);
        }
        for (i, chunk) in tail.chunks(cap).enumerate() {
            let pgno = pages[i];
            let next = pages.get(i + 1).copied().unwrap_or(0);
            let mut data = vec![0u8; self.page_size as usize];
            data[..4].copy_from_slice(&next.to_be_bytes());
            data[4..4 + chunk.len()].copy_from_slice(chunk);
            self.put_page(pgno, data)?;
            if i == 0 {
                self.ptrmap_put(pgno, PtrmapType::Overflow1, owner)?;
            } else {
                self.ptrmap_put(pgno, PtrmapType::Overflow2, pages[i - 1])?;
            }
        }
        tracing::debug!(first = pages[0], pages = n_pages, bytes = tail.len(), "wrote overflow chain");
        Ok(pages[0])
    }

    /// Write the spilled part of an encoded cell and patch its pointer
    pub(crate) fn spill_cell(&mut self, cell: &mut EncodedCell, payload: &[u8], owner: Pgno) -> Result<()> {
        if !cell.has_overflow() {
            return Ok(());
        }
        let first = self.write_overflow_chain(&payload[cell.local..], owner)?;
        cell.set_overflow_pgno(first)
    }

    /// Read `n_bytes` of payload from a chain starting at `first`
    pub(crate) fn read_overflow_chain(&mut self, first: Pgno, n_bytes: usize) -> Result<Vec<u8>> {
        let cap = overflow_page_capacity(self.usable_size);
        let mut out = Vec::with_capacity(n_bytes);
        let mut seen = HashSet::new();
        let mut pgno = first;
        while out.len() < n_bytes {
            if pgno == 0 {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow chain from {} ends {} bytes early", first, n_bytes - out.len()),
                ));
            }
            if pgno > self.page_count() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow page {} beyond end of file", pgno),
                ));
            }
            if !seen.insert(pgno) {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow chain from {} revisits page {}", first, pgno),
                ));
            }
            let page = self.get_page(pgno)?;
            let take = (n_bytes - out.len()).min(cap);
            out.extend_from_slice(&page.data[4..4 + take]);
            pgno = read_u32(&page.data, 0).unwrap_or(0);
        }
        if pgno != 0 {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("overflow chain from {} longer than its payload", first),
            ));
        }
        Ok(out)
    }

    /// Release `n_pages` pages of a chain to the freelist (clearCell)
    pub(crate) fn free_overflow_chain(&mut self, first: Pgno, n_pages: usize) -> Result<()> {
        let mut seen = HashSet::new();
        let mut pgno = first;
        for i in 0..n_pages {
            if pgno < 2 || pgno > self.page_count() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow page {} out of range ({} of {})", pgno, i + 1, n_pages),
                ));
            }
            if !seen.insert(pgno) {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow chain from {} loops at {}", first, pgno),
                ));
            }
            let next = read_u32(&self.get_page(pgno)?.data, 0).unwrap_or(0);
            if i + 1 == n_pages && next != 0 {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow chain from {} longer than its payload", first),
                ));
            }
            self.free_page(pgno)?;
            pgno = next;
        }
        Ok(())
    }

    /// Free the overflow pages a cell owns
    pub(crate) fn clear_cell(&mut self, info: &CellInfo) -> Result<()> {
        if let Some(first) = info.overflow_pgno {
            let n_pages = self.params.overflow_pages(info.n_payload, info.n_local);
            self.free_overflow_chain(first, n_pages)?;
        }
        Ok(())
    }

    /// Full payload of cell `index` (key bytes for index trees, data for tables)
    pub(crate) fn cell_payload(&mut self, page: &MemPage, index: usize) -> Result<Vec<u8>> {
        let info = page.cell_info(index)?;
        let local_end = info.payload_offset + info.n_local as usize;
        let mut payload = page.data[info.payload_offset..local_end].to_vec();
        if let Some(first) = info.overflow_pgno {
            let rest = (info.n_payload - info.n_local) as usize;
            payload.extend(self.read_overflow_chain(first, rest)?);
        }
        Ok(payload)
    }

    /// `amount` payload bytes of cell `index` starting at `offset`, touching
    /// only the overflow pages the range needs (accessPayload)
    pub(crate) fn payload_range(
        &mut self,
        page: &MemPage,
        index: usize,
        offset: usize,
        amount: usize,
    ) -> Result<Vec<u8>> {
        let info = page.cell_info(index)?;
        let n_payload = info.n_payload as usize;
        let end = offset.checked_add(amount).filter(|&end| end <= n_payload).ok_or_else(|| {
            Error::with_message(
                ErrorCode::Range,
                format!("payload range {}+{} past {} bytes", offset, amount, n_payload),
            )
        })?;

        let mut out = Vec::with_capacity(amount);
        let n_local = info.n_local as usize;
        if offset < n_local {
            let local_end = end.min(n_local);
            out.extend_from_slice(&page.data[info.payload_offset + offset..info.payload_offset + local_end]);
        }
        if end <= n_local {
            return Ok(out);
        }

        let cap = overflow_page_capacity(self.usable_size);
        let mut pgno = info.overflow_pgno.unwrap_or(0);
        let mut page_start = n_local;
        let mut hops = 0;
        while page_start < end {
            if pgno < 2 || pgno > self.page_count() {
                return Err(Error::with_message(
                    ErrorCode::Corrupt,
                    format!("overflow page {} out of range", pgno),
                ));
            }
            hops += 1;
            if hops > self.page_count() {
                return Err(Error::with_message(ErrorCode::Corrupt, "overflow chain loops"));
            }
            let data = self.get_page(pgno)?.data;
            let page_end = page_start + cap;
            if page_end > offset {
                let from = offset.max(page_start) - page_start;
                let to = end.min(page_end) - page_start;
                out.extend_from_slice(&data[4 + from..4 + to]);
            }
            page_start = page_end;
            pgno = read_u32(&data, 0).unwrap_or(0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{AutoVacuum, BtreeConfig};
    use crate::error::ErrorCode;
    use crate::storage::btree::types::PtrmapType;
    use crate::storage::btree::Btree;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_chain_roundtrip_sizes() {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        for len in [1usize, 508, 509, 1016, 3000] {
            let data = payload(len);
            let first = shared.write_overflow_chain(&data, 1).unwrap();
            assert_eq!(shared.read_overflow_chain(first, len).unwrap(), data);
        }
    }

    #[test]
    fn test_short_chain_is_corrupt() {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        let first = shared.write_overflow_chain(&payload(600), 1).unwrap();
        // Asking for more than the chain holds runs off its end.
        let err = shared.read_overflow_chain(first, 2000).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Corrupt);
        // Asking for less leaves pages unread.
        assert!(shared.read_overflow_chain(first, 100).is_err());
    }

    #[test]
    fn test_cyclic_chain_is_corrupt() {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        let first = shared.write_overflow_chain(&payload(1200), 1).unwrap();
        let second = u32::from_be_bytes(shared.get_page(first).unwrap().data[..4].try_into().unwrap());
        let mut data = shared.get_page(second).unwrap().data;
        data[..4].copy_from_slice(&first.to_be_bytes());
        shared.put_page(second, data).unwrap();
        assert!(shared.read_overflow_chain(first, 1200).unwrap_err().is_corrupt());
        assert!(shared.free_overflow_chain(first, 3).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_free_chain_returns_pages() {
        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        let first = shared.write_overflow_chain(&payload(1500), 1).unwrap();
        shared.free_overflow_chain(first, 3).unwrap();
        assert_eq!(shared.freelist_count().unwrap(), 3);
    }

    #[test]
    fn test_payload_range_reads_across_pages() {
        use crate::storage::btree::types::TreeKind;
        use crate::storage::btree::BtreePayload;

        let bt = Btree::open_memory(BtreeConfig::default().with_page_size(512)).unwrap();
        let root = bt.create_table(TreeKind::Table).unwrap();
        let data = payload(2000);
        let mut cursor = bt.cursor(root, true).unwrap();
        cursor.insert(&BtreePayload::row(5, data.clone())).unwrap();

        let mut shared = bt.lock_shared().unwrap();
        let leaf = shared.load_page(root).unwrap();
        for (offset, amount) in [(0usize, 10usize), (30, 100), (400, 700), (1990, 10), (0, 2000), (2000, 0)] {
            let got = shared.payload_range(&leaf, 0, offset, amount).unwrap();
            assert_eq!(got, &data[offset..offset + amount], "range {}+{}", offset, amount);
        }
        let err = shared.payload_range(&leaf, 0, 1990, 11).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Range);
    }

    #[test]
    fn test_chain_records_ptrmap_entries() {
        let config = BtreeConfig::default()
            .with_page_size(512)
            .with_auto_vacuum(AutoVacuum::Full);
        let bt = Btree::open_memory(config).unwrap();
        let mut shared = bt.lock_shared().unwrap();
        let first = shared.write_overflow_chain(&payload(1100), 1).unwrap();
        assert_eq!(shared.ptrmap_get(first).unwrap(), (PtrmapType::Overflow1, 1));
        let second = u32::from_be_bytes(shared.get_page(first).unwrap().data[..4].try_into().unwrap());
        assert_eq!(shared.ptrmap_get(second).unwrap(), (PtrmapType::Overflow2, first));
    }
}
