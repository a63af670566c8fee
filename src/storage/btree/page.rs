//! Page layout engine
//!
//! A B-tree page is a header, a cell-pointer array growing down from the
//! header, and cell bodies growing up from the end of the usable area.
//! Space released inside the content area is kept on a sorted chain of
//! freeblocks; slivers under four bytes are counted as fragments.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::cell::{decode_cell, CellInfo, PayloadParams};
use super::encoding::{read_u16, read_u32, write_u16, write_u32};
use super::types::{PageKind, PageLimits, CELL_PTR_SIZE, MAX_FRAGMENTED_BYTES, MIN_CELL_SIZE};

/// Build a corruption error for a page, logging its header bytes
fn corrupt_page(pgno: Pgno, data: &[u8], hdr: usize, what: &str) -> Error {
    let end = (hdr + 12).min(data.len());
    let start = hdr.min(end);
    tracing::warn!(
        pgno,
        header = %hex::encode(&data[start..end]),
        "corrupt page: {}",
        what
    );
    Error::with_message(ErrorCode::Corrupt, format!("page {}: {}", pgno, what))
}

/// Fields of a B-tree page header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageHeader {
    pub kind: PageKind,
    pub first_freeblock: u16,
    pub n_cell: u16,
    /// Start of the cell content area; stored as 0 when it is 65536
    pub content_start: usize,
    pub frag_bytes: u8,
    /// Rightmost child, interior pages only
    pub right_child: Option<Pgno>,
}

impl PageHeader {
    pub fn empty(kind: PageKind, usable_size: u32) -> Self {
        Self {
            kind,
            first_freeblock: 0,
            n_cell: 0,
            content_start: usable_size as usize,
            frag_bytes: 0,
            right_child: if kind.is_leaf() { None } else { Some(0) },
        }
    }

    pub fn parse(data: &[u8], hdr: usize) -> Result<Self> {
        let bad = |what: &str| Error::with_message(ErrorCode::Corrupt, what.to_string());
        let flags = *data.get(hdr).ok_or_else(|| bad("page header truncated"))?;
        let kind = PageKind::from_flags(flags)
            .ok_or_else(|| bad(&format!("invalid page flags {:#04x}", flags)))?;
        let first_freeblock = read_u16(data, hdr + 1).ok_or_else(|| bad("page header truncated"))?;
        let n_cell = read_u16(data, hdr + 3).ok_or_else(|| bad("page header truncated"))?;
        let raw_start = read_u16(data, hdr + 5).ok_or_else(|| bad("page header truncated"))?;
        let content_start = if raw_start == 0 { 65536 } else { raw_start as usize };
        let frag_bytes = *data.get(hdr + 7).ok_or_else(|| bad("page header truncated"))?;
        let right_child = if kind.is_leaf() {
            None
        } else {
            Some(read_u32(data, hdr + 8).ok_or_else(|| bad("page header truncated"))?)
        };
        Ok(Self {
            kind,
            first_freeblock,
            n_cell,
            content_start,
            frag_bytes,
            right_child,
        })
    }

    pub fn write(&self, data: &mut [u8], hdr: usize) -> Result<()> {
        *data.get_mut(hdr).ok_or(Error::new(ErrorCode::Internal))? = self.kind.flags();
        write_u16(data, hdr + 1, self.first_freeblock)?;
        write_u16(data, hdr + 3, self.n_cell)?;
        write_u16(data, hdr + 5, (self.content_start & 0xffff) as u16)?;
        data[hdr + 7] = self.frag_bytes;
        if let Some(child) = self.right_child {
            write_u32(data, hdr + 8, child)?;
        }
        Ok(())
    }
}

/// In-memory image of a B-tree page
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemPage {
    pub pgno: Pgno,
    pub data: Vec<u8>,
    pub limits: PageLimits,
    pub params: PayloadParams,
    pub header: PageHeader,
    /// Free bytes: gap + freeblocks + fragments
    pub n_free: usize,
    /// Cells that did not fit, as (logical index, bytes) in insertion order
    pub overflow: Vec<(usize, Vec<u8>)>,
}

impl MemPage {
    /// Parse and validate a page image (btreeInitPage)
    pub fn parse(pgno: Pgno, data: Vec<u8>, limits: PageLimits, params: PayloadParams) -> Result<Self> {
        let hdr = limits.header_start();
        let usable = limits.usable_end();
        if data.len() < limits.page_size as usize || hdr + 8 > usable {
            return Err(corrupt_page(pgno, &data, hdr, "page image too short"));
        }
        let header = match PageHeader::parse(&data, hdr) {
            Ok(header) => header,
            Err(err) => {
                let what = err.message().unwrap_or("bad page header").to_string();
                return Err(corrupt_page(pgno, &data, hdr, &what));
            }
        };

        let mut page = Self {
            pgno,
            data,
            limits,
            params,
            header,
            n_free: 0,
            overflow: Vec::new(),
        };

        if page.n_cell() > limits.max_cells() {
            return Err(page.corrupt("cell count exceeds page capacity"));
        }
        let ptr_end = page.ptr_array_end();
        if ptr_end > usable {
            return Err(page.corrupt("cell pointer array overruns page"));
        }
        if page.header.content_start < ptr_end || page.header.content_start > usable {
            return Err(page.corrupt("content area overlaps pointer array"));
        }
        for i in 0..page.n_cell() {
            let ptr = page.raw_cell_ptr(i)?;
            if ptr < page.header.content_start || ptr >= usable {
                return Err(page.corrupt(&format!("cell pointer {} out of bounds", ptr)));
            }
            let size = page.cell_info(i)?.n_size;
            if ptr + size > usable {
                return Err(page.corrupt(&format!("cell {} extends past usable area", i)));
            }
        }
        page.n_free = page.compute_free_space()?;
        Ok(page)
    }

    /// A zeroed page of the given kind (zeroPage)
    pub fn new_empty(pgno: Pgno, kind: PageKind, limits: PageLimits, params: PayloadParams) -> Result<Self> {
        let mut page = Self {
            pgno,
            data: vec![0u8; limits.page_size as usize],
            limits,
            params,
            header: PageHeader::empty(kind, limits.usable_size),
            n_free: 0,
            overflow: Vec::new(),
        };
        page.reset(kind)?;
        Ok(page)
    }

    /// Clear all content and give the page a fresh header of `kind`.
    /// Bytes before the header (the file header on page 1) are kept.
    pub fn reset(&mut self, kind: PageKind) -> Result<()> {
        let hdr = self.limits.header_start();
        let usable = self.limits.usable_end();
        self.data[hdr..usable].fill(0);
        self.header = PageHeader::empty(kind, self.limits.usable_size);
        self.overflow.clear();
        self.n_free = usable - self.cell_ptr_start();
        self.header.write(&mut self.data, hdr)
    }

    fn corrupt(&self, what: &str) -> Error {
        corrupt_page(self.pgno, &self.data, self.limits.header_start(), what)
    }

    fn write_header(&mut self) -> Result<()> {
        let hdr = self.limits.header_start();
        self.header.write(&mut self.data, hdr)
    }

    pub fn kind(&self) -> PageKind {
        self.header.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.header.kind.is_leaf()
    }

    pub fn n_cell(&self) -> usize {
        self.header.n_cell as usize
    }

    pub fn has_overflow(&self) -> bool {
        !self.overflow.is_empty()
    }

    /// Cells including those parked in the overflow list
    pub fn logical_cell_count(&self) -> usize {
        self.n_cell() + self.overflow.len()
    }

    pub fn header_size(&self) -> usize {
        self.header.kind.header_size()
    }

    pub fn cell_ptr_start(&self) -> usize {
        self.limits.header_start() + self.header_size()
    }

    pub fn ptr_array_end(&self) -> usize {
        self.cell_ptr_start() + self.n_cell() * CELL_PTR_SIZE
    }

    /// Bytes available for cells and pointers on an empty page of this kind
    pub fn capacity(&self) -> usize {
        self.limits.usable_end() - self.cell_ptr_start()
    }

    /// Free space exceeds half the usable area
    pub fn is_underfull(&self) -> bool {
        self.n_free > self.limits.usable_size as usize / 2
    }

    fn raw_cell_ptr(&self, index: usize) -> Result<usize> {
        let at = self.cell_ptr_start() + index * CELL_PTR_SIZE;
        read_u16(&self.data, at)
            .map(|p| p as usize)
            .ok_or_else(|| self.corrupt("cell pointer array truncated"))
    }

    fn set_cell_ptr(&mut self, index: usize, offset: usize) -> Result<()> {
        let at = self.cell_ptr_start() + index * CELL_PTR_SIZE;
        write_u16(&mut self.data, at, offset as u16)
    }

    pub fn cell_ptr(&self, index: usize) -> Result<usize> {
        if index >= self.n_cell() {
            return Err(Error::with_message(
                ErrorCode::Range,
                format!("cell {} of {} on page {}", index, self.n_cell(), self.pgno),
            ));
        }
        let ptr = self.raw_cell_ptr(index)?;
        if ptr < self.ptr_array_end() || ptr + MIN_CELL_SIZE > self.limits.usable_end() {
            return Err(self.corrupt(&format!("cell pointer {} out of bounds", ptr)));
        }
        Ok(ptr)
    }

    /// The whole cell-pointer array, in key order
    pub fn cell_ptrs(&self) -> Result<Vec<usize>> {
        (0..self.n_cell()).map(|i| self.cell_ptr(i)).collect()
    }

    pub fn cell_info(&self, index: usize) -> Result<CellInfo> {
        let ptr = self.cell_ptr(index)?;
        let usable = self.limits.usable_end();
        decode_cell(&self.data[..usable], ptr, self.kind(), &self.params)
    }

    /// The on-page bytes of a cell
    pub fn cell_bytes(&self, index: usize) -> Result<&[u8]> {
        let ptr = self.cell_ptr(index)?;
        let size = self.cell_info(index)?.n_size;
        self.data
            .get(ptr..ptr + size)
            .ok_or_else(|| self.corrupt("cell extends past page"))
    }

    /// Child page `index` of an interior page; `n_cell` names the right child
    pub fn child_pgno(&self, index: usize) -> Result<Pgno> {
        if self.is_leaf() {
            return Err(Error::with_message(ErrorCode::Internal, "leaf page has no children"));
        }
        let child = if index < self.n_cell() {
            let ptr = self.cell_ptr(index)?;
            read_u32(&self.data, ptr).ok_or_else(|| self.corrupt("child pointer truncated"))?
        } else if index == self.n_cell() {
            self.header.right_child.unwrap_or(0)
        } else {
            return Err(Error::new(ErrorCode::Range));
        };
        if child == 0 {
            return Err(self.corrupt(&format!("child {} is page 0", index)));
        }
        Ok(child)
    }

    pub fn set_child_pgno(&mut self, index: usize, child: Pgno) -> Result<()> {
        if self.is_leaf() {
            return Err(Error::with_message(ErrorCode::Internal, "leaf page has no children"));
        }
        if index < self.n_cell() {
            let ptr = self.cell_ptr(index)?;
            write_u32(&mut self.data, ptr, child)
        } else if index == self.n_cell() {
            self.set_right_child(child)
        } else {
            Err(Error::new(ErrorCode::Range))
        }
    }

    pub fn set_right_child(&mut self, child: Pgno) -> Result<()> {
        if self.is_leaf() {
            return Err(Error::with_message(ErrorCode::Internal, "leaf page has no right child"));
        }
        self.header.right_child = Some(child);
        self.write_header()
    }

    /// Index of the child pointer that references `child`
    pub fn find_child(&self, child: Pgno) -> Result<Option<usize>> {
        for i in 0..=self.n_cell() {
            if self.child_pgno(i)? == child {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Freeblock chain as (offset, size) pairs
    pub fn free_blocks(&self) -> Result<Vec<(usize, usize)>> {
        let usable = self.limits.usable_end();
        let max_blocks = usable / MIN_CELL_SIZE;
        let mut blocks = Vec::new();
        let mut last_end = self.header.content_start;
        let mut pc = self.header.first_freeblock as usize;
        while pc != 0 {
            if pc < last_end || pc + 4 > usable {
                return Err(self.corrupt(&format!("freeblock at {} out of order", pc)));
            }
            let next = read_u16(&self.data, pc).unwrap_or(0) as usize;
            let size = read_u16(&self.data, pc + 2).unwrap_or(0) as usize;
            if size < 4 || pc + size > usable {
                return Err(self.corrupt(&format!("freeblock at {} has size {}", pc, size)));
            }
            blocks.push((pc, size));
            if blocks.len() > max_blocks {
                return Err(self.corrupt("freeblock chain loops"));
            }
            last_end = pc + size;
            pc = next;
        }
        Ok(blocks)
    }

    fn compute_free_space(&self) -> Result<usize> {
        let gap = self.header.content_start - self.ptr_array_end();
        let blocks: usize = self.free_blocks()?.iter().map(|&(_, size)| size).sum();
        let n_free = gap + blocks + self.header.frag_bytes as usize;
        if n_free > self.limits.usable_end() - self.cell_ptr_start() {
            return Err(self.corrupt("free space exceeds page"));
        }
        Ok(n_free)
    }

    fn set_link(&mut self, link: Option<usize>, value: usize) -> Result<()> {
        match link {
            None => {
                self.header.first_freeblock = value as u16;
                self.write_header()
            }
            Some(at) => write_u16(&mut self.data, at, value as u16),
        }
    }

    /// Reserve `n_byte` bytes for a cell body (allocateSpace).
    ///
    /// The caller has checked that `n_free` covers the cell and its pointer.
    pub fn allocate_space(&mut self, n_byte: usize) -> Result<usize> {
        let n_byte = n_byte.max(MIN_CELL_SIZE);
        let ptr_end = self.ptr_array_end();

        if self.header.content_start >= ptr_end + CELL_PTR_SIZE {
            // Best fit on the freeblock chain
            let mut best: Option<(Option<usize>, usize, usize)> = None;
            let mut link = None;
            for (pc, size) in self.free_blocks()? {
                if size >= n_byte && best.map_or(true, |(_, _, s)| size < s) {
                    best = Some((link, pc, size));
                }
                link = Some(pc);
            }
            if let Some((link, pc, size)) = best {
                let remainder = size - n_byte;
                if remainder >= 4 {
                    write_u16(&mut self.data, pc + 2, remainder as u16)?;
                    self.n_free -= n_byte;
                    return Ok(pc + remainder);
                }
                let frag = self.header.frag_bytes as usize + remainder;
                if frag <= MAX_FRAGMENTED_BYTES {
                    let next = read_u16(&self.data, pc).unwrap_or(0) as usize;
                    self.set_link(link, next)?;
                    self.header.frag_bytes = frag as u8;
                    self.write_header()?;
                    self.n_free -= n_byte;
                    return Ok(pc);
                }
            }

            if self.header.content_start >= ptr_end + CELL_PTR_SIZE + n_byte {
                return self.carve_from_gap(n_byte);
            }
        }

        self.defragment()?;
        if self.header.content_start < self.ptr_array_end() + CELL_PTR_SIZE + n_byte {
            return Err(self.corrupt("no room after defragment"));
        }
        self.carve_from_gap(n_byte)
    }

    fn carve_from_gap(&mut self, n_byte: usize) -> Result<usize> {
        self.header.content_start -= n_byte;
        self.write_header()?;
        self.n_free -= n_byte;
        Ok(self.header.content_start)
    }

    /// Return `size` bytes at `start` to the page (freeSpace)
    pub fn free_space(&mut self, start: usize, size: usize) -> Result<()> {
        let end = start + size;
        if start < self.header.content_start || end > self.limits.usable_end() {
            return Err(self.corrupt(&format!("free of {}..{} outside content area", start, end)));
        }
        if size < 4 {
            let frag = self.header.frag_bytes as usize + size;
            if frag > u8::MAX as usize {
                return Err(self.corrupt("fragment count overflow"));
            }
            self.header.frag_bytes = frag as u8;
            self.n_free += size;
            return self.write_header();
        }

        let mut link = None;
        let mut prev: Option<(usize, usize)> = None;
        let mut next = 0usize;
        for (pc, block_size) in self.free_blocks()? {
            if pc >= start {
                next = pc;
                break;
            }
            prev = Some((pc, block_size));
            link = Some(pc);
        }
        if next != 0 && next < end {
            return Err(self.corrupt(&format!("freed span {}..{} overlaps freeblock", start, end)));
        }
        if let Some((pc, block_size)) = prev {
            if pc + block_size > start {
                return Err(self.corrupt(&format!("freed span {}..{} overlaps freeblock", start, end)));
            }
        }

        let mut frag = self.header.frag_bytes as usize;
        let mut new_end = end;
        let mut after = next;
        if next != 0 && next - end <= 3 {
            let gap = next - end;
            if gap > frag {
                return Err(self.corrupt("fragment count underflow"));
            }
            frag -= gap;
            new_end = next + read_u16(&self.data, next + 2).unwrap_or(0) as usize;
            after = read_u16(&self.data, next).unwrap_or(0) as usize;
        }

        let mut new_start = start;
        let mut merged_prev = false;
        if let Some((pc, block_size)) = prev {
            let gap = start - (pc + block_size);
            if gap <= 3 {
                if gap > frag {
                    return Err(self.corrupt("fragment count underflow"));
                }
                frag -= gap;
                new_start = pc;
                merged_prev = true;
            }
        }
        self.header.frag_bytes = frag as u8;
        self.n_free += size;

        if new_start == self.header.content_start {
            // The block borders the gap: grow the gap instead.
            self.header.first_freeblock = after as u16;
            self.header.content_start = new_end;
            return self.write_header();
        }

        write_u16(&mut self.data, new_start, after as u16)?;
        write_u16(&mut self.data, new_start + 2, (new_end - new_start) as u16)?;
        if !merged_prev {
            self.set_link(link, new_start)?;
        }
        self.write_header()
    }

    /// Move every cell body to the end of the usable area (defragmentPage)
    pub fn defragment(&mut self) -> Result<()> {
        let snapshot = self.data.clone();
        let usable = self.limits.usable_end();
        let mut top = usable;
        for i in 0..self.n_cell() {
            let ptr = self.cell_ptr(i)?;
            let size = decode_cell(&snapshot[..usable], ptr, self.kind(), &self.params)?.n_size;
            if size > top || ptr + size > usable {
                return Err(self.corrupt("cells overflow page during defragment"));
            }
            top -= size;
            self.data[top..top + size].copy_from_slice(&snapshot[ptr..ptr + size]);
            self.set_cell_ptr(i, top)?;
        }
        let ptr_end = self.ptr_array_end();
        if top < ptr_end {
            return Err(self.corrupt("cells overlap pointer array"));
        }
        self.data[ptr_end..top].fill(0);
        self.header.first_freeblock = 0;
        self.header.frag_bytes = 0;
        self.header.content_start = top;
        self.n_free = top - ptr_end;
        self.write_header()
    }

    /// Insert a cell at `index`. Without room the cell is parked in the
    /// overflow list for balance to place.
    pub fn insert_cell(&mut self, index: usize, cell: Vec<u8>) -> Result<()> {
        if index > self.logical_cell_count() {
            return Err(Error::with_message(
                ErrorCode::Range,
                format!("insert at {} past {} cells", index, self.logical_cell_count()),
            ));
        }
        if self.has_overflow() || cell.len() + CELL_PTR_SIZE > self.n_free {
            self.overflow.push((index, cell));
            return Ok(());
        }
        if self.n_cell() + 1 > self.limits.max_cells() {
            self.overflow.push((index, cell));
            return Ok(());
        }

        let offset = self.allocate_space(cell.len())?;
        self.data[offset..offset + cell.len()].copy_from_slice(&cell);
        let at = self.cell_ptr_start() + index * CELL_PTR_SIZE;
        let ptr_end = self.ptr_array_end();
        self.data.copy_within(at..ptr_end, at + CELL_PTR_SIZE);
        write_u16(&mut self.data, at, offset as u16)?;
        self.header.n_cell += 1;
        self.n_free -= CELL_PTR_SIZE;
        self.write_header()
    }

    /// Remove cell `index` and release its body (dropCell)
    pub fn drop_cell(&mut self, index: usize) -> Result<()> {
        let ptr = self.cell_ptr(index)?;
        let size = self.cell_info(index)?.n_size;
        self.free_space(ptr, size)?;

        let at = self.cell_ptr_start() + index * CELL_PTR_SIZE;
        let ptr_end = self.ptr_array_end();
        self.data.copy_within(at + CELL_PTR_SIZE..ptr_end, at);
        self.data[ptr_end - CELL_PTR_SIZE..ptr_end].fill(0);
        self.header.n_cell -= 1;
        self.n_free += CELL_PTR_SIZE;

        if self.header.n_cell == 0 {
            let usable = self.limits.usable_end();
            let start = self.cell_ptr_start();
            self.data[start..usable].fill(0);
            self.header.first_freeblock = 0;
            self.header.frag_bytes = 0;
            self.header.content_start = usable;
            self.n_free = usable - start;
        }
        self.write_header()
    }

    /// On-page cells merged with the overflow list, in key order
    pub fn logical_cells(&self) -> Result<Vec<Vec<u8>>> {
        let mut cells = Vec::with_capacity(self.logical_cell_count());
        for i in 0..self.n_cell() {
            cells.push(self.cell_bytes(i)?.to_vec());
        }
        for (index, cell) in &self.overflow {
            if *index > cells.len() {
                return Err(Error::with_message(
                    ErrorCode::Internal,
                    format!("overflow cell index {} past {}", index, cells.len()),
                ));
            }
            cells.insert(*index, cell.clone());
        }
        Ok(cells)
    }

    /// Whether `cells` fit on an empty page of this page's geometry
    pub fn fits(&self, cells: &[Vec<u8>], kind: PageKind) -> bool {
        let room = self.limits.usable_end() - self.limits.header_start() - kind.header_size();
        let need: usize = cells.iter().map(|c| c.len() + CELL_PTR_SIZE).sum();
        need <= room && cells.len() <= self.limits.max_cells()
    }

    /// Replace the whole page with `cells` packed against the end
    pub fn rebuild(&mut self, kind: PageKind, cells: &[Vec<u8>], right_child: Option<Pgno>) -> Result<()> {
        if !self.fits(cells, kind) {
            return Err(Error::with_message(
                ErrorCode::Internal,
                format!("{} cells do not fit on page {}", cells.len(), self.pgno),
            ));
        }
        self.reset(kind)?;
        let mut top = self.limits.usable_end();
        for (i, cell) in cells.iter().enumerate() {
            top -= cell.len();
            self.data[top..top + cell.len()].copy_from_slice(cell);
            self.set_cell_ptr(i, top)?;
        }
        self.header.n_cell = cells.len() as u16;
        self.header.content_start = top;
        if !kind.is_leaf() {
            self.header.right_child = Some(right_child.unwrap_or(0));
        }
        self.n_free = top - self.ptr_array_end();
        self.write_header()
    }
}
