use std::fmt;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rustix::fs::{open, Mode, OFlags};

use crate::pmem::{clwb, clwb_range, sfence};

pub const REGION_MAGIC: [u8; 8] = *b"PBLKSTOR";
pub const REGION_VERSION: u32 = 1;
pub const REGION_HEADER_BYTES: u64 = 64;
pub const CHUNK_HEADER_BYTES: u64 = 16;
pub const CHUNK_ALIGN: u64 = 64;
pub const NULL_OFFSET: u64 = 0;

const CHUNK_LIVE: u64 = 0x4C49_5645;
const CHUNK_FREE: u64 = 0x4652_4545;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMode {
    ColdStart,
    WarmStart,
}

#[derive(Debug)]
pub enum RegionError {
    InvalidSize(usize),
    BadMagic,
    BadVersion { found: u32, expected: u32 },
    CorruptHeader(String),
    Exhausted { requested: u64, remaining: u64 },
    Io(std::io::Error),
}

impl fmt::Display for RegionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionError::InvalidSize(size) => {
                write!(f, "persistent region size {} is invalid", size)
            }
            RegionError::BadMagic => write!(f, "persistent region magic mismatch"),
            RegionError::BadVersion { found, expected } => write!(
                f,
                "persistent region version {} != expected {}",
                found, expected
            ),
            RegionError::CorruptHeader(msg) => {
                write!(f, "persistent region header is corrupt: {}", msg)
            }
            RegionError::Exhausted {
                requested,
                remaining,
            } => write!(
                f,
                "persistent region exhausted (requested {}, remaining {})",
                requested, remaining
            ),
            RegionError::Io(err) => write!(f, "persistent region io error: {}", err),
        }
    }
}

impl std::error::Error for RegionError {}

impl From<std::io::Error> for RegionError {
    fn from(value: std::io::Error) -> Self {
        RegionError::Io(value)
    }
}

/// 64-byte durable region header at offset 0.
///
/// Field offsets are load-bearing for recovery: magic at 0, version at 8,
/// epoch at 16, allocator head at 24, reserved to 64.
#[repr(C, align(64))]
struct RegionHeader {
    magic: [u8; 8],
    version: u32,
    _pad: u32,
    epoch: AtomicU64,
    durable_head: AtomicU64,
    _reserved: [u8; 32],
}

/// Precedes every allocated block. `len` is the full chunk length including
/// this header, always a multiple of [`CHUNK_ALIGN`]; `state` is LIVE or FREE.
#[repr(C)]
struct ChunkHeader {
    len: AtomicU64,
    state: AtomicU64,
}

#[derive(Debug)]
struct FreeList {
    chunks: Vec<(u64, u64)>,
}

/// A file-backed, byte-addressable persistent region with a crash-consistent
/// bump allocator. All persistent links are offsets from the region base
/// (0 = null); blocks are addressed by the offset of their content, which
/// starts [`CHUNK_HEADER_BYTES`] past the chunk start.
#[derive(Debug)]
pub struct PmRegion {
    base: NonNull<u8>,
    len: usize,
    alloc: Mutex<FreeList>,
}

// SAFETY:
// All mutation of the mapped region goes through atomics or the allocator
// mutex; block contents are published only via the epoch layer's fences.
unsafe impl Send for PmRegion {}
unsafe impl Sync for PmRegion {}

impl PmRegion {
    /// Maps (creating if necessary) the region file at `path` with exactly
    /// `byte_len` bytes. An existing region with a valid header is attached
    /// warm; a fresh or all-zero file is initialized cold. A pre-existing
    /// header with the wrong magic or version is refused.
    pub fn open(path: impl AsRef<Path>, byte_len: usize) -> Result<(Self, AttachMode), RegionError> {
        if byte_len < (REGION_HEADER_BYTES + CHUNK_ALIGN) as usize {
            return Err(RegionError::InvalidSize(byte_len));
        }

        let path = path.as_ref();
        let fd = open(
            path,
            OFlags::RDWR | OFlags::CREATE,
            Mode::from_bits(0o600).unwrap_or(Mode::empty()),
        )
        .map_err(|err| RegionError::Io(std::io::Error::from_raw_os_error(err.raw_os_error())))?;

        let current_len = std::fs::metadata(path)?.len() as usize;
        if current_len != byte_len {
            let wanted = libc::off_t::try_from(byte_len)
                .map_err(|_| RegionError::InvalidSize(byte_len))?;
            // SAFETY:
            // `fd` is an open read/write descriptor and `wanted` was
            // bounds-checked above.
            let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), wanted) };
            if rc != 0 {
                return Err(RegionError::Io(std::io::Error::last_os_error()));
            }
        }

        // SAFETY:
        // `fd` references a regular file of at least `byte_len` bytes opened
        // read/write; MAP_SHARED makes stores reach the file.
        let map_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                byte_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if map_ptr == libc::MAP_FAILED {
            return Err(RegionError::Io(std::io::Error::last_os_error()));
        }
        let base = NonNull::new(map_ptr.cast::<u8>()).ok_or_else(|| {
            RegionError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "mmap returned null",
            ))
        })?;

        let region = Self {
            base,
            len: byte_len,
            alloc: Mutex::new(FreeList { chunks: Vec::new() }),
        };

        let mode = match region.classify_header() {
            HeaderState::Blank => {
                region.initialize_header();
                AttachMode::ColdStart
            }
            HeaderState::Valid => {
                region.validate_durable_head()?;
                region.rebuild_free_list()?;
                AttachMode::WarmStart
            }
            HeaderState::WrongVersion(found) => {
                return Err(RegionError::BadVersion {
                    found,
                    expected: REGION_VERSION,
                });
            }
            HeaderState::WrongMagic => return Err(RegionError::BadMagic),
        };

        tracing::info!(
            path = %path.display(),
            bytes = byte_len,
            ?mode,
            "attached persistent region"
        );
        Ok((region, mode))
    }

    /// Allocates a block with room for `block_bytes` of content and returns
    /// the content offset. The chunk header is durable before the allocator
    /// head advances past it, so a crashed allocation either has no effect or
    /// yields a scannable chunk.
    pub fn palloc(&self, block_bytes: u64) -> Result<u64, RegionError> {
        let need = align_up(CHUNK_HEADER_BYTES + block_bytes, CHUNK_ALIGN);
        let mut state = self
            .alloc
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(pos) = state.chunks.iter().position(|&(_, len)| len >= need) {
            let (chunk_off, _) = state.chunks.swap_remove(pos);
            let header = self.chunk_header(chunk_off);
            header.state.store(CHUNK_LIVE, Ordering::Release);
            clwb(self.ptr_at(chunk_off));
            sfence();
            return Ok(chunk_off + CHUNK_HEADER_BYTES);
        }

        let header = self.header();
        let head = header.durable_head.load(Ordering::Acquire);
        let end = head
            .checked_add(need)
            .ok_or(RegionError::InvalidSize(self.len))?;
        if end > self.len as u64 {
            return Err(RegionError::Exhausted {
                requested: need,
                remaining: self.len as u64 - head,
            });
        }

        let chunk = self.chunk_header(head);
        chunk.len.store(need, Ordering::Release);
        chunk.state.store(CHUNK_LIVE, Ordering::Release);
        clwb(self.ptr_at(head));
        sfence();

        header.durable_head.store(end, Ordering::Release);
        clwb(self.base.as_ptr());
        sfence();

        Ok(head + CHUNK_HEADER_BYTES)
    }

    /// Returns the block at `block_off` (a content offset from [`palloc`]).
    pub fn pfree(&self, block_off: u64) {
        let chunk_off = block_off - CHUNK_HEADER_BYTES;
        let chunk = self.chunk_header(chunk_off);
        debug_assert_eq!(chunk.state.load(Ordering::Acquire), CHUNK_LIVE);
        chunk.state.store(CHUNK_FREE, Ordering::Release);
        clwb(self.ptr_at(chunk_off));
        sfence();

        let len = chunk.len.load(Ordering::Acquire);
        let mut state = self
            .alloc
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.chunks.push((chunk_off, len));
    }

    /// Walks every chunk below the durable allocator head and yields the
    /// content offset of each LIVE one. The walk stops at the first
    /// malformed chunk header (a torn allocation tail).
    pub fn recover_scan(&self) -> Vec<u64> {
        let head = self.header().durable_head.load(Ordering::Acquire);
        let mut live = Vec::new();
        let mut off = REGION_HEADER_BYTES;
        while off < head {
            let chunk = self.chunk_header(off);
            let len = chunk.len.load(Ordering::Acquire);
            if len == 0 || len % CHUNK_ALIGN != 0 || off + len > head {
                tracing::warn!(offset = off, "stopping scan at torn chunk header");
                break;
            }
            match chunk.state.load(Ordering::Acquire) {
                CHUNK_LIVE => live.push(off + CHUNK_HEADER_BYTES),
                CHUNK_FREE => {}
                _ => {
                    tracing::warn!(offset = off, "stopping scan at unknown chunk state");
                    break;
                }
            }
            off += len;
        }
        live
    }

    /// Number of LIVE chunks currently in the region.
    pub fn live_chunk_count(&self) -> usize {
        self.recover_scan().len()
    }

    /// Content capacity of the block at `block_off`.
    pub fn block_capacity(&self, block_off: u64) -> u64 {
        let chunk = self.chunk_header(block_off - CHUNK_HEADER_BYTES);
        chunk.len.load(Ordering::Acquire) - CHUNK_HEADER_BYTES
    }

    pub fn persisted_epoch(&self) -> u64 {
        self.header().epoch.load(Ordering::Acquire)
    }

    pub fn persist_epoch(&self, epoch: u64) {
        self.header().epoch.store(epoch, Ordering::Release);
        clwb(self.base.as_ptr());
        sfence();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to `off` inside the mapping.
    #[inline]
    pub(crate) fn ptr_at(&self, off: u64) -> *mut u8 {
        debug_assert!((off as usize) < self.len, "offset {} out of region", off);
        // SAFETY:
        // `off` is within the mapping per the assert; callers never retain
        // the pointer past the region's lifetime.
        unsafe { self.base.as_ptr().add(off as usize) }
    }

    #[inline]
    fn header(&self) -> &RegionHeader {
        // SAFETY:
        // Offset 0 of the mapping always holds the region header; it is
        // initialized before any other access in `open`.
        unsafe { &*self.base.as_ptr().cast::<RegionHeader>() }
    }

    #[inline]
    fn chunk_header(&self, chunk_off: u64) -> &ChunkHeader {
        debug_assert!(chunk_off >= REGION_HEADER_BYTES);
        debug_assert_eq!(chunk_off % CHUNK_ALIGN, 0);
        // SAFETY:
        // Chunk offsets are produced only by `palloc`/`recover_scan`, both of
        // which keep them aligned and in bounds.
        unsafe { &*self.ptr_at(chunk_off).cast::<ChunkHeader>() }
    }

    fn classify_header(&self) -> HeaderState {
        let header = self.header();
        if header.magic == [0_u8; 8] {
            return HeaderState::Blank;
        }
        if header.magic != REGION_MAGIC {
            return HeaderState::WrongMagic;
        }
        if header.version != REGION_VERSION {
            return HeaderState::WrongVersion(header.version);
        }
        HeaderState::Valid
    }

    fn initialize_header(&self) {
        let ptr = self.base.as_ptr().cast::<RegionHeader>();
        // SAFETY:
        // Cold start; nothing else references the mapping yet.
        unsafe {
            ptr.write(RegionHeader {
                magic: REGION_MAGIC,
                version: REGION_VERSION,
                _pad: 0,
                epoch: AtomicU64::new(0),
                durable_head: AtomicU64::new(REGION_HEADER_BYTES),
                _reserved: [0_u8; 32],
            });
        }
        clwb_range(self.base.as_ptr(), REGION_HEADER_BYTES as usize);
        sfence();
    }

    fn validate_durable_head(&self) -> Result<(), RegionError> {
        let head = self.header().durable_head.load(Ordering::Acquire);
        if head < REGION_HEADER_BYTES || head > self.len as u64 || head % CHUNK_ALIGN != 0 {
            return Err(RegionError::CorruptHeader(format!(
                "allocator head {} out of bounds for region of {} bytes",
                head, self.len
            )));
        }
        Ok(())
    }

    /// Re-seeds the transient free list from FREE chunks after a warm attach.
    fn rebuild_free_list(&self) -> Result<(), RegionError> {
        let head = self.header().durable_head.load(Ordering::Acquire);
        let mut free = Vec::new();
        let mut off = REGION_HEADER_BYTES;
        while off < head {
            let chunk = self.chunk_header(off);
            let len = chunk.len.load(Ordering::Acquire);
            if len == 0 || len % CHUNK_ALIGN != 0 || off + len > head {
                break;
            }
            if chunk.state.load(Ordering::Acquire) == CHUNK_FREE {
                free.push((off, len));
            }
            off += len;
        }
        let mut state = self
            .alloc
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.chunks = free;
        Ok(())
    }
}

enum HeaderState {
    Blank,
    Valid,
    WrongMagic,
    WrongVersion(u32),
}

impl Drop for PmRegion {
    fn drop(&mut self) {
        // SAFETY:
        // `base` and `len` originate from a successful `mmap` in `open`.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        debug_assert_eq!(rc, 0, "munmap failed: {}", std::io::Error::last_os_error());
    }
}

#[inline]
pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
