//! Cell codec
//!
//! Cell layouts by page kind:
//!
//! | kind            | cell                                                        |
//! |-----------------|-------------------------------------------------------------|
//! | table leaf      | `varint nPayload, varint rowid, payload[local], [u32 ovfl]` |
//! | table interior  | `u32 leftChild, varint rowid`                               |
//! | index leaf      | `varint nPayload, payload[local], [u32 ovfl]`               |
//! | index interior  | `u32 leftChild, varint nPayload, payload[local], [u32 ovfl]`|
//!
//! Payload beyond the local portion lives in an overflow chain whose first
//! page number closes the cell.

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

use super::encoding::{read_u32, read_varint, read_varint32, write_varint};
use super::types::{PageKind, MIN_CELL_SIZE};

/// Bytes of payload carried by each overflow page
pub fn overflow_page_capacity(usable_size: u32) -> usize {
    usable_size as usize - 4
}

/// Local payload size for a payload of `n_payload` bytes
pub fn local_payload(n_payload: u32, max_local: u32, min_local: u32, usable_size: u32) -> u32 {
    if n_payload <= max_local {
        return n_payload;
    }
    let surplus = min_local + (n_payload - min_local) % (usable_size - 4);
    if surplus <= max_local {
        surplus
    } else {
        min_local
    }
}

/// Payload spill thresholds derived from the usable page size
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PayloadParams {
    pub usable_size: u32,
    /// Index pages
    pub max_local: u32,
    pub min_local: u32,
    /// Table leaves
    pub max_leaf: u32,
    pub min_leaf: u32,
}

impl PayloadParams {
    pub fn new(usable_size: u32, max_frac: u8, min_frac: u8, leaf_frac: u8) -> Self {
        let scaled = |frac: u8| ((usable_size - 12) * frac as u32 / 255).saturating_sub(23);
        Self {
            usable_size,
            max_local: scaled(max_frac),
            min_local: scaled(min_frac),
            max_leaf: usable_size - 35,
            min_leaf: scaled(leaf_frac),
        }
    }

    /// (max, min) local payload for cells of this page kind
    pub fn local_limits(&self, kind: PageKind) -> (u32, u32) {
        match kind {
            PageKind::TableLeaf | PageKind::TableInterior => (self.max_leaf, self.min_leaf),
            PageKind::IndexLeaf | PageKind::IndexInterior => (self.max_local, self.min_local),
        }
    }

    pub fn local_size(&self, kind: PageKind, n_payload: u32) -> u32 {
        let (max, min) = self.local_limits(kind);
        local_payload(n_payload, max, min, self.usable_size)
    }

    /// Number of overflow pages a payload needs
    pub fn overflow_pages(&self, n_payload: u32, n_local: u32) -> usize {
        let spill = (n_payload - n_local) as usize;
        let cap = overflow_page_capacity(self.usable_size);
        spill.div_ceil(cap)
    }
}

/// Parsed cell metadata (CellInfo in SQLite)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CellInfo {
    pub left_child: Option<Pgno>,
    /// Rowid for table cells, payload size for index cells
    pub n_key: i64,
    pub n_payload: u32,
    pub n_local: u32,
    /// Bytes before the local payload
    pub n_header: usize,
    /// Total bytes the cell occupies on the page
    pub n_size: usize,
    pub overflow_pgno: Option<Pgno>,
    /// Absolute offset of the local payload
    pub payload_offset: usize,
}

impl CellInfo {
    pub fn has_overflow(&self) -> bool {
        self.n_payload > self.n_local
    }
}

/// Decode the cell at `offset` in a page image
pub fn decode_cell(
    data: &[u8],
    offset: usize,
    kind: PageKind,
    params: &PayloadParams,
) -> Result<CellInfo> {
    let mut pos = offset;
    let mut info = CellInfo::default();

    if !kind.is_leaf() {
        let child = read_u32(data, pos).ok_or(Error::with_message(
            ErrorCode::Corrupt,
            format!("cell at {} truncated", offset),
        ))?;
        info.left_child = Some(child);
        pos += 4;
    }

    if kind == PageKind::TableInterior {
        let (rowid, n) = read_varint(data, pos)?;
        pos += n;
        info.n_key = rowid as i64;
        info.n_header = pos - offset;
        info.n_size = info.n_header;
        info.payload_offset = pos;
        return Ok(info);
    }

    let (n_payload, n) = read_varint32(data, pos)?;
    pos += n;
    info.n_payload = n_payload;
    info.n_key = n_payload as i64;
    if kind == PageKind::TableLeaf {
        let (rowid, n) = read_varint(data, pos)?;
        pos += n;
        info.n_key = rowid as i64;
    }
    info.n_header = pos - offset;
    info.payload_offset = pos;

    info.n_local = params.local_size(kind, n_payload);
    let mut end = pos + info.n_local as usize;
    if info.has_overflow() {
        let ovfl = read_u32(data, end).ok_or(Error::with_message(
            ErrorCode::Corrupt,
            format!("overflow pointer of cell at {} past end of page", offset),
        ))?;
        if ovfl == 0 {
            return Err(Error::with_message(
                ErrorCode::Corrupt,
                format!("cell at {} has a zero overflow pointer", offset),
            ));
        }
        info.overflow_pgno = Some(ovfl);
        end += 4;
    }
    if end > data.len() {
        return Err(Error::with_message(
            ErrorCode::Corrupt,
            format!("cell at {} extends past end of page", offset),
        ));
    }
    info.n_size = (end - offset).max(MIN_CELL_SIZE);
    Ok(info)
}

/// A cell built for insertion, plus the payload it could not hold
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedCell {
    pub bytes: Vec<u8>,
    /// Payload bytes stored in the cell itself
    pub local: usize,
    /// Byte count destined for each overflow page, in chain order
    pub overflow_chunks: Vec<usize>,
    overflow_ptr_offset: Option<usize>,
}

impl EncodedCell {
    pub fn has_overflow(&self) -> bool {
        self.overflow_ptr_offset.is_some()
    }

    /// Fill the overflow pointer slot once the chain is written
    pub fn set_overflow_pgno(&mut self, pgno: Pgno) -> Result<()> {
        let at = self
            .overflow_ptr_offset
            .ok_or(Error::with_message(ErrorCode::Internal, "cell has no overflow slot"))?;
        self.bytes[at..at + 4].copy_from_slice(&pgno.to_be_bytes());
        Ok(())
    }
}

/// Build a cell. `int_key` is the rowid for table cells and ignored for
/// index cells, whose key is the payload.
pub fn encode_cell(
    kind: PageKind,
    params: &PayloadParams,
    left_child: Option<Pgno>,
    int_key: i64,
    payload: &[u8],
) -> Result<EncodedCell> {
    let mut bytes = Vec::with_capacity(payload.len().min(params.usable_size as usize) + 24);
    if !kind.is_leaf() {
        let child = left_child.ok_or(Error::with_message(
            ErrorCode::Internal,
            "interior cell needs a left child",
        ))?;
        bytes.extend_from_slice(&child.to_be_bytes());
    }

    if kind == PageKind::TableInterior {
        write_varint(int_key as u64, &mut bytes);
        return Ok(EncodedCell {
            bytes,
            local: 0,
            overflow_chunks: Vec::new(),
            overflow_ptr_offset: None,
        });
    }

    let n_payload = u32::try_from(payload.len()).map_err(|_| {
        Error::with_message(ErrorCode::Misuse, "payload larger than 4 GiB")
    })?;
    write_varint(n_payload as u64, &mut bytes);
    if kind == PageKind::TableLeaf {
        write_varint(int_key as u64, &mut bytes);
    }

    let local = params.local_size(kind, n_payload) as usize;
    bytes.extend_from_slice(&payload[..local]);

    let mut overflow_chunks = Vec::new();
    let mut overflow_ptr_offset = None;
    if local < payload.len() {
        let cap = overflow_page_capacity(params.usable_size);
        let mut rest = payload.len() - local;
        while rest > 0 {
            let chunk = rest.min(cap);
            overflow_chunks.push(chunk);
            rest -= chunk;
        }
        overflow_ptr_offset = Some(bytes.len());
        bytes.extend_from_slice(&[0; 4]);
    }
    if bytes.len() < MIN_CELL_SIZE {
        bytes.resize(MIN_CELL_SIZE, 0);
    }

    Ok(EncodedCell {
        bytes,
        local,
        overflow_chunks,
        overflow_ptr_offset,
    })
}

/// Exact on-page size of a standalone cell of the given kind
pub fn cell_size(bytes: &[u8], kind: PageKind, params: &PayloadParams) -> Result<usize> {
    Ok(decode_cell(bytes, 0, kind, params)?.n_size)
}

/// Left child of an interior cell
pub fn cell_left_child(bytes: &[u8]) -> Result<Pgno> {
    read_u32(bytes, 0).ok_or(Error::with_message(ErrorCode::Corrupt, "interior cell truncated"))
}

pub fn set_cell_left_child(bytes: &mut [u8], child: Pgno) -> Result<()> {
    super::encoding::write_u32(bytes, 0, child)
}

/// Unpadded length of a cell: header, local payload, overflow pointer
fn cell_content_len(info: &CellInfo) -> usize {
    info.n_header + info.n_local as usize + if info.has_overflow() { 4 } else { 0 }
}

/// Turn an index leaf cell into an interior cell whose left child is `child`
pub fn index_leaf_to_interior(bytes: &[u8], params: &PayloadParams, child: Pgno) -> Result<Vec<u8>> {
    let info = decode_cell(bytes, 0, PageKind::IndexLeaf, params)?;
    let len = cell_content_len(&info);
    let mut cell = Vec::with_capacity(len + 4);
    cell.extend_from_slice(&child.to_be_bytes());
    cell.extend_from_slice(&bytes[..len]);
    Ok(cell)
}

/// Strip the child pointer off an index interior cell
pub fn index_interior_to_leaf(bytes: &[u8], params: &PayloadParams) -> Result<Vec<u8>> {
    let info = decode_cell(bytes, 0, PageKind::IndexInterior, params)?;
    let len = cell_content_len(&info);
    let mut cell = bytes
        .get(4..len)
        .ok_or(Error::with_message(ErrorCode::Corrupt, "interior cell truncated"))?
        .to_vec();
    if cell.len() < MIN_CELL_SIZE {
        cell.resize(MIN_CELL_SIZE, 0);
    }
    Ok(cell)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params(usable: u32) -> PayloadParams {
        PayloadParams::new(usable, 64, 32, 32)
    }

    #[test]
    fn test_payload_params_4096() {
        let p = params(4096);
        assert_eq!(p.max_local, 1002);
        assert_eq!(p.min_local, 489);
        assert_eq!(p.max_leaf, 4061);
        assert_eq!(p.min_leaf, 489);
    }

    #[test]
    fn test_payload_params_512() {
        let p = params(512);
        assert_eq!(p.max_local, 102);
        assert_eq!(p.min_local, 39);
        assert_eq!(p.max_leaf, 477);
    }

    #[test]
    fn test_local_payload_rules() {
        let p = params(4096);
        assert_eq!(p.local_size(PageKind::TableLeaf, 4061), 4061);
        // surplus = 489 + (5000 - 489) % 4092 = 908
        assert_eq!(p.local_size(PageKind::TableLeaf, 5000), 908);
        // surplus = 489 + (8000 - 489) % 4092 = 3908, fits under max_leaf
        assert_eq!(p.local_size(PageKind::TableLeaf, 8000), 3908);
        // index pages spill much earlier; surplus above max_local falls back to min
        assert_eq!(p.local_size(PageKind::IndexLeaf, 1002), 1002);
        assert_eq!(p.local_size(PageKind::IndexLeaf, 3000), 489);
    }

    #[test]
    fn test_table_leaf_cell() {
        let p = params(4096);
        let cell = encode_cell(PageKind::TableLeaf, &p, None, 300, b"hello").unwrap();
        assert_eq!(cell.bytes, [&[5u8, 0x82, 0x2c][..], b"hello"].concat());
        assert!(!cell.has_overflow());

        let info = decode_cell(&cell.bytes, 0, PageKind::TableLeaf, &p).unwrap();
        assert_eq!(info.n_key, 300);
        assert_eq!(info.n_payload, 5);
        assert_eq!(info.n_local, 5);
        assert_eq!(info.n_header, 3);
        assert_eq!(info.n_size, 8);
        assert_eq!(info.payload_offset, 3);
        assert_eq!(info.overflow_pgno, None);
    }

    #[test]
    fn test_tiny_cell_is_padded() {
        let p = params(4096);
        let cell = encode_cell(PageKind::TableLeaf, &p, None, 1, b"").unwrap();
        assert_eq!(cell.bytes.len(), 4);
        let info = decode_cell(&cell.bytes, 0, PageKind::TableLeaf, &p).unwrap();
        assert_eq!(info.n_size, 4);
    }

    #[test]
    fn test_table_interior_cell() {
        let p = params(4096);
        let cell = encode_cell(PageKind::TableInterior, &p, Some(7), 1000, &[]).unwrap();
        assert_eq!(cell.bytes, vec![0, 0, 0, 7, 0x87, 0x68]);
        let info = decode_cell(&cell.bytes, 0, PageKind::TableInterior, &p).unwrap();
        assert_eq!(info.left_child, Some(7));
        assert_eq!(info.n_key, 1000);
        assert_eq!(info.n_size, 6);
        assert_eq!(cell_left_child(&cell.bytes).unwrap(), 7);
    }

    #[test]
    fn test_index_cell_with_overflow() {
        let p = params(512);
        let key: Vec<u8> = (0..1200u32).map(|i| (i % 251) as u8).collect();
        let mut cell = encode_cell(PageKind::IndexInterior, &p, Some(9), 0, &key).unwrap();
        assert!(cell.has_overflow());
        let local = p.local_size(PageKind::IndexInterior, 1200) as usize;
        assert_eq!(cell.local, local);
        assert_eq!(cell.overflow_chunks.iter().sum::<usize>(), 1200 - local);
        assert!(cell.overflow_chunks.iter().all(|&c| c <= 508));
        cell.set_overflow_pgno(44).unwrap();

        let info = decode_cell(&cell.bytes, 0, PageKind::IndexInterior, &p).unwrap();
        assert_eq!(info.left_child, Some(9));
        assert_eq!(info.n_payload, 1200);
        assert_eq!(info.n_local as usize, local);
        assert_eq!(info.overflow_pgno, Some(44));
        assert_eq!(info.n_size, cell.bytes.len());
        assert_eq!(
            &cell.bytes[info.payload_offset..info.payload_offset + local],
            &key[..local]
        );
        assert_eq!(p.overflow_pages(info.n_payload, info.n_local), cell.overflow_chunks.len());
    }

    #[test]
    fn test_index_cell_moves_between_levels() {
        let p = params(512);
        // A one-byte key pads to four bytes as a leaf cell.
        let leaf = encode_cell(PageKind::IndexLeaf, &p, None, 0, &[7]).unwrap().bytes;
        assert_eq!(leaf, vec![1, 7, 0, 0]);
        let interior = index_leaf_to_interior(&leaf, &p, 9).unwrap();
        assert_eq!(interior, vec![0, 0, 0, 9, 1, 7]);
        assert_eq!(cell_size(&interior, PageKind::IndexInterior, &p).unwrap(), 6);
        assert_eq!(index_interior_to_leaf(&interior, &p).unwrap(), leaf);

        let key = vec![3u8; 300];
        let mut big = encode_cell(PageKind::IndexLeaf, &p, None, 0, &key).unwrap();
        big.set_overflow_pgno(44).unwrap();
        let interior = index_leaf_to_interior(&big.bytes, &p, 5).unwrap();
        let info = decode_cell(&interior, 0, PageKind::IndexInterior, &p).unwrap();
        assert_eq!(info.left_child, Some(5));
        assert_eq!(info.overflow_pgno, Some(44));
        assert_eq!(info.n_size, interior.len());
        assert_eq!(index_interior_to_leaf(&interior, &p).unwrap(), big.bytes);
    }

    #[test]
    fn test_decode_truncated_cell_is_corrupt() {
        let p = params(4096);
        let cell = encode_cell(PageKind::TableLeaf, &p, None, 1, &[1u8; 50]).unwrap();
        let err = decode_cell(&cell.bytes[..20], 0, PageKind::TableLeaf, &p).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Corrupt);
        assert!(decode_cell(&[0x80], 0, PageKind::IndexLeaf, &p).is_err());
    }

    #[test]
    fn test_zero_overflow_pointer_is_corrupt() {
        let p = params(512);
        let cell = encode_cell(PageKind::TableLeaf, &p, None, 1, &[3u8; 2000]).unwrap();
        let err = decode_cell(&cell.bytes, 0, PageKind::TableLeaf, &p).unwrap_err();
        assert!(err.is_corrupt());
    }

    proptest! {
        #[test]
        fn prop_encoded_size_matches_decoded(
            len in 0usize..5000,
            rowid in any::<i64>(),
            leaf in any::<bool>(),
        ) {
            let p = params(1024);
            let payload = vec![0xabu8; len];
            let kind = if leaf { PageKind::TableLeaf } else { PageKind::IndexLeaf };
            let mut cell = encode_cell(kind, &p, None, rowid, &payload).unwrap();
            if cell.has_overflow() {
                cell.set_overflow_pgno(2).unwrap();
            }
            let info = decode_cell(&cell.bytes, 0, kind, &p).unwrap();
            prop_assert_eq!(info.n_size, cell.bytes.len());
            prop_assert_eq!(info.n_local as usize, cell.local);
            prop_assert_eq!(info.n_payload as usize, len);
            prop_assert!(cell.bytes.len() <= (p.usable_size as usize - 35) + 9 + 9 + 4);
            if leaf {
                prop_assert_eq!(info.n_key, rowid);
            }
        }
    }
}
