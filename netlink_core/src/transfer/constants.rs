/// Default TCP port for file transfer
pub const TRANSFER_PORT: u16 = 5000;

/// Buffer size for streaming file bodies (4KB)
pub const BUFFER_SIZE: usize = 4096;

/// Chunk size the resumable sender announces and writes with (64KB)
pub const PREFERRED_CHUNK_SIZE: u32 = 64 * 1024;

/// Read size used when hashing files (64KB)
pub const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Longest accepted filename on the wire, in bytes
pub const MAX_FILENAME_LENGTH: usize = 4096;

/// Largest chunk size a sender may announce (16MB)
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;
