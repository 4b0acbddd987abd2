//! Geometry of the ATA disks the kernel drives.

/// The number of bytes in one disk sector (block).
pub const SECTOR_SIZE_IN_BYTES: usize = 512;
/// ATA PIO transfers one 16-bit word at a time, so a sector is 256 words.
pub const WORDS_PER_SECTOR: usize = SECTOR_SIZE_IN_BYTES / 2;

/// The port I/O base of the primary ATA channel (`0x1F0..=0x1F7`).
pub const PRIMARY_CHANNEL_DATA_PORT: u16 = 0x1F0;
