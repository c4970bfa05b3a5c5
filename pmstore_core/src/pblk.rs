use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::epoch::EpochSys;
use crate::pmem::{clwb_range, sfence};
use crate::region::{PmRegion, RegionError, NULL_OFFSET};

/// Durable block header. `prev` is a self-relative content offset of the
/// previous version of the same `id` (0 = none). `crc32` covers the header
/// minus this field plus the payload; the link cell between header and
/// payload mutates after publication and is deliberately outside coverage.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PBlkHeader {
    pub id: u64,
    pub epoch: u64,
    pub prev: u64,
    pub blk_type: u8,
    _pad: [u8; 7],
    pub payload_len: u32,
    pub crc32: u32,
}

pub const BLK_HEADER_BYTES: u64 = size_of::<PBlkHeader>() as u64;
pub const LINK_CELL_BYTES: u64 = 8;
pub const PAYLOAD_OFFSET: u64 = BLK_HEADER_BYTES + LINK_CELL_BYTES;

const CRC_FIELD_OFFSET: usize = 36;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BlkType {
    Owned = 0,
    Alloc = 1,
    Update = 2,
    Delete = 3,
}

impl BlkType {
    #[inline]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(BlkType::Owned),
            1 => Some(BlkType::Alloc),
            2 => Some(BlkType::Update),
            3 => Some(BlkType::Delete),
            _ => None,
        }
    }

    /// True for the types that can be the live version of an id.
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, BlkType::Alloc | BlkType::Update)
    }
}

#[inline]
pub fn header(region: &PmRegion, off: u64) -> &PBlkHeader {
    debug_assert_ne!(off, NULL_OFFSET);
    // SAFETY:
    // `off` is a content offset from the region allocator; the header is
    // immutable once the creating fence has run.
    unsafe { &*region.ptr_at(off).cast::<PBlkHeader>() }
}

/// The 8-byte mutable cell between header and payload. Map nodes store their
/// tagged successor offset here; other block types leave it null.
#[inline]
pub fn link_cell(region: &PmRegion, off: u64) -> &AtomicU64 {
    debug_assert_ne!(off, NULL_OFFSET);
    // SAFETY:
    // The cell is within the block's chunk and 8-byte aligned because chunk
    // content starts 64-byte aligned and the header is 40 bytes.
    unsafe { &*region.ptr_at(off + BLK_HEADER_BYTES).cast::<AtomicU64>() }
}

#[inline]
pub fn payload(region: &PmRegion, off: u64) -> &[u8] {
    let len = header(region, off).payload_len as usize;
    // SAFETY:
    // `payload_len` was bounds-checked against the chunk capacity when the
    // block was written; payload bytes are immutable after the creating fence.
    unsafe { std::slice::from_raw_parts(region.ptr_at(off + PAYLOAD_OFFSET), len) }
}

/// Allocates and writes a new, unpublished version: header, null link cell,
/// payload, CRC, then flush + fence. The block is durable on return but
/// reachable only by the caller.
pub fn write_new(
    region: &PmRegion,
    id: u64,
    blk_type: BlkType,
    epoch: u64,
    prev: u64,
    payload: &[u8],
) -> Result<u64, RegionError> {
    let total = BLK_HEADER_BYTES + LINK_CELL_BYTES + payload.len() as u64;
    let off = region.palloc(total)?;

    let hdr = PBlkHeader {
        id,
        epoch,
        prev,
        blk_type: blk_type as u8,
        _pad: [0_u8; 7],
        payload_len: payload.len() as u32,
        crc32: 0,
    };
    let crc = checksum(&hdr, payload);

    let base = region.ptr_at(off);
    // SAFETY:
    // `palloc` reserved `total` bytes at `off` exclusively for this call.
    unsafe {
        let mut stamped = hdr;
        stamped.crc32 = crc;
        base.cast::<PBlkHeader>().write(stamped);
        base.add(BLK_HEADER_BYTES as usize)
            .cast::<AtomicU64>()
            .write(AtomicU64::new(NULL_OFFSET));
        std::ptr::copy_nonoverlapping(
            payload.as_ptr(),
            base.add(PAYLOAD_OFFSET as usize),
            payload.len(),
        );
    }
    clwb_range(base, total as usize);
    sfence();
    Ok(off)
}

/// Validates a scanned block: well-formed type, in-bounds payload, matching
/// CRC. A failure means the block was never fully written and must be treated
/// as absent.
pub fn integrity_check(region: &PmRegion, off: u64) -> bool {
    let hdr = header(region, off);
    if BlkType::from_raw(hdr.blk_type).is_none() {
        return false;
    }
    let capacity = region.block_capacity(off);
    if PAYLOAD_OFFSET + hdr.payload_len as u64 > capacity {
        return false;
    }
    checksum(hdr, payload(region, off)) == hdr.crc32
}

/// Highest-epoch data version with `epoch <= at_epoch`, following the `prev`
/// chain from `off` (which must be the newest version known to the caller).
pub fn live_version_at(region: &PmRegion, off: u64, at_epoch: u64) -> Option<u64> {
    let mut cursor = off;
    while cursor != NULL_OFFSET {
        let hdr = header(region, cursor);
        let ty = BlkType::from_raw(hdr.blk_type)?;
        if hdr.epoch <= at_epoch && ty.is_data() {
            return Some(cursor);
        }
        cursor = hdr.prev;
    }
    None
}

fn checksum(hdr: &PBlkHeader, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    // SAFETY:
    // `PBlkHeader` is `repr(C)` with explicit padding; viewing it as bytes is
    // well-defined.
    let hdr_bytes = unsafe {
        std::slice::from_raw_parts(hdr as *const PBlkHeader as *const u8, size_of::<PBlkHeader>())
    };
    hasher.update(&hdr_bytes[..CRC_FIELD_OFFSET]);
    hasher.update(payload);
    hasher.finalize()
}

/// A versioned persistent cell holding one plain-old-data value. Reads and
/// writes open block versions through the transaction scope, so `get`
/// observes the version live at the caller's epoch and `set` chains a new
/// version that commits with the enclosing operation.
pub struct PCell<T: Copy> {
    head: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Copy> PCell<T> {
    /// Allocates the initial version inside an active operation.
    pub fn create(esys: &EpochSys, tid: usize, value: T) -> Result<Self, RegionError> {
        let off = esys.alloc_pblk(tid, &encode(&value))?;
        Ok(Self {
            head: AtomicU64::new(off),
            _marker: PhantomData,
        })
    }

    /// Re-attaches a cell to a block surviving recovery.
    pub fn from_recovered(off: u64) -> Self {
        Self {
            head: AtomicU64::new(off),
            _marker: PhantomData,
        }
    }

    pub fn block_id(&self, esys: &EpochSys) -> u64 {
        header(esys.region(), self.head.load(Ordering::Acquire)).id
    }

    /// Value of the version live at the caller's epoch, or `None` when the
    /// cell has no version old enough for a lagging reader.
    pub fn get(&self, esys: &EpochSys, tid: usize) -> Option<T> {
        let off = esys.openread_pblk(tid, self.head.load(Ordering::Acquire))?;
        Some(decode(payload(esys.region(), off)))
    }

    /// Chains a new version carrying `value`. Returns `false` when the scope
    /// is aborted and the write was dropped.
    pub fn set(&self, esys: &EpochSys, tid: usize, value: T) -> Result<bool, RegionError> {
        let bytes = encode(&value);
        loop {
            let old = self.head.load(Ordering::Acquire);
            let new = match esys.openwrite_pblk(tid, old, &bytes)? {
                Some(new) => new,
                None => return Ok(false),
            };
            if self
                .head
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                esys.preclaim(tid, old, NULL_OFFSET);
                return Ok(true);
            }
            esys.discard_new_version(tid, new);
        }
    }
}

fn encode<T: Copy>(value: &T) -> Vec<u8> {
    // SAFETY:
    // `T: Copy` values are stored byte-for-byte; padding bytes may be
    // arbitrary but round-trip unchanged.
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, size_of::<T>()).to_vec()
    }
}

fn decode<T: Copy>(bytes: &[u8]) -> T {
    assert!(bytes.len() >= size_of::<T>(), "payload shorter than value");
    // SAFETY:
    // Length checked above; `read_unaligned` handles any payload alignment.
    unsafe { bytes.as_ptr().cast::<T>().read_unaligned() }
}
