//! Hard limits on caller-supplied input.

pub const MAX_NOTE_LEN: usize = 2_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_OCCURRENCES_PER_REQUEST: usize = 1_000;
pub const MAX_PAGE_SIZE: usize = 500;
pub const MAX_BLOCKS_PER_CAREGIVER: usize = 10_000;

/// Upper bound on a single WAL record payload. Larger lengths are treated as corruption.
pub const MAX_WAL_RECORD_BYTES: usize = 64 * 1024 * 1024;

/// Target size of one snapshot record. Compaction splits the snapshot so no record
/// approaches [`MAX_WAL_RECORD_BYTES`].
pub const SNAPSHOT_CHUNK_BYTES: usize = 8 * 1024 * 1024;
