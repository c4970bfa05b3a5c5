pub mod config;
pub mod epoch;
pub mod hashmap;
pub mod pblk;
pub mod pmem;
pub mod recovery;
pub mod region;
pub mod tracker;

pub use config::{ConfigError, StoreConfig, DEFAULT_EPOCH_WINDOW, DEFAULT_RECLAIM_GAP};
pub use epoch::{EpochSys, SysMode, NULL_EPOCH};
pub use hashmap::{MapError, PLockfreeHashMap, BUCKET_COUNT};
pub use pblk::{BlkType, PBlkHeader, PCell, BLK_HEADER_BYTES, PAYLOAD_OFFSET};
pub use pmem::{clwb, clwb_range, sfence, CACHE_LINE_BYTES};
pub use recovery::{recover, RecoveryError};
pub use region::{AttachMode, PmRegion, RegionError, NULL_OFFSET, REGION_MAGIC, REGION_VERSION};
pub use tracker::{RetireTracker, RetiredBlock, RECLAIM_BATCH};
