//! A deliberately flat file system: every file is exactly one 512-byte
//! disk block, and the block number is the file id.
//!
//! There is no on-disk metadata at all. A file's `size` counts the valid
//! bytes within its block and lives only in the in-memory handle; the
//! handle table is rebuilt empty on every mount. What the format buys is
//! a minimal read/write/seek surface over the blocking disk for code
//! layered above it.
//!
//! Handles are shared as [`FileRef`]s; the per-file `Mutex` serializes
//! the read-modify-write cycles that sub-block writes require.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;

#[cfg(test)]
extern crate std;


use alloc::sync::Arc;
use alloc::vec::Vec;

use ata_disk::AtaDisk;
use kernel_config::disk::SECTOR_SIZE_IN_BYTES;
use spin::Mutex;

const BLOCK_SIZE: u32 = SECTOR_SIZE_IN_BYTES as u32;

/// A shared, lockable handle to an open file.
pub type FileRef = Arc<Mutex<File>>;

/// One file: a single disk block plus a cursor and a byte count.
pub struct File {
    id: u32,
    /// Valid bytes in the block; grows as writes pass the old end.
    size: u32,
    /// The cursor the next sequential read or write starts at.
    pos: u32,
    disk: &'static AtaDisk,
}

impl File {
    fn new(id: u32, size: u32, disk: &'static AtaDisk) -> File {
        File {
            id,
            size,
            pos: 0,
            disk,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Whether the cursor sits at the end of the valid bytes.
    pub fn is_eof(&self) -> bool {
        self.pos == self.size
    }

    /// Reads up to `buf.len()` bytes from the cursor forward, stopping
    /// at the end of the file. Returns the number of bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() || self.pos >= self.size {
            return 0;
        }
        let mut block = [0u8; SECTOR_SIZE_IN_BYTES];
        self.disk.read(self.id, &mut block);

        let n = core::cmp::min(buf.len(), (self.size - self.pos) as usize);
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&block[start..start + n]);
        self.pos += n as u32;
        n
    }

    /// Writes up to `buf.len()` bytes at the cursor, growing the file's
    /// size for every byte written past the old end; a file can never
    /// outgrow its one block. Returns the number of bytes written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        if buf.is_empty() || self.pos >= BLOCK_SIZE {
            return 0;
        }
        // Read-modify-write: the rest of the block must survive.
        let mut block = [0u8; SECTOR_SIZE_IN_BYTES];
        self.disk.read(self.id, &mut block);

        let n = core::cmp::min(buf.len(), (BLOCK_SIZE - self.pos) as usize);
        let start = self.pos as usize;
        block[start..start + n].copy_from_slice(&buf[..n]);
        self.disk.write(self.id, &block);

        self.pos += n as u32;
        if self.pos > self.size {
            self.size = self.pos;
        }
        n
    }

    /// Moves the cursor back to the start of the file.
    pub fn reset(&mut self) {
        self.pos = 0;
    }

    /// Erases the file: zeroes its block and forgets its contents.
    pub fn rewrite(&mut self) {
        let zeroes = [0u8; SECTOR_SIZE_IN_BYTES];
        self.disk.write(self.id, &zeroes);
        self.size = 0;
        self.pos = 0;
    }
}

struct FsInner {
    disk: Option<&'static AtaDisk>,
    files: Vec<Option<FileRef>>,
}

/// The file system: an in-memory table of handles, one slot per disk
/// block.
pub struct FileSystem {
    inner: Mutex<FsInner>,
}

impl FileSystem {
    pub const fn new() -> FileSystem {
        FileSystem {
            inner: Mutex::new(FsInner {
                disk: None,
                files: Vec::new(),
            }),
        }
    }

    /// Binds the file system to `disk` and sizes the handle table to one
    /// slot per block.
    pub fn mount(&self, disk: &'static AtaDisk) -> Result<(), &'static str> {
        let mut inner = self.inner.lock();
        if inner.disk.is_some() {
            return Err("file system is already mounted");
        }
        let slots = (disk.size() / BLOCK_SIZE) as usize;
        inner.files = Vec::new();
        inner.files.resize_with(slots, || None);
        inner.disk = Some(disk);
        debug!("mounted file system, {} file slots", slots);
        Ok(())
    }

    /// Wipes `disk`: writes a zero block over every sector.
    pub fn format(disk: &'static AtaDisk) {
        let zeroes = [0u8; SECTOR_SIZE_IN_BYTES];
        for block in 0..disk.size() / BLOCK_SIZE {
            disk.write(block, &zeroes);
        }
        debug!("formatted disk, {} blocks", disk.size() / BLOCK_SIZE);
    }

    /// The number of file slots, i.e. disk blocks. Zero before mounting.
    pub fn capacity(&self) -> usize {
        self.inner.lock().files.len()
    }

    /// The live handle for `id`, if such a file exists.
    pub fn lookup_file(&self, id: u32) -> Option<FileRef> {
        let inner = self.inner.lock();
        inner.files.get(id as usize).and_then(|slot| slot.clone())
    }

    /// Creates the file `id` over its block. Fails if the file system is
    /// unmounted, `id` is out of range, or the file already exists.
    pub fn create_file(&self, id: u32) -> Result<FileRef, &'static str> {
        let mut inner = self.inner.lock();
        let disk = inner.disk.ok_or("file system is not mounted")?;
        let slot = inner
            .files
            .get_mut(id as usize)
            .ok_or("file id is beyond the disk")?;
        if slot.is_some() {
            return Err("a file with that id already exists");
        }
        let file = Arc::new(Mutex::new(File::new(id, 0, disk)));
        *slot = Some(file.clone());
        debug!("created file {}", id);
        Ok(file)
    }

    /// Deletes the file `id`: zeroes its block and releases the handle
    /// slot. Deleting a file that does not exist is a no-op.
    pub fn delete_file(&self, id: u32) -> Result<(), &'static str> {
        let mut inner = self.inner.lock();
        if inner.disk.is_none() {
            return Err("file system is not mounted");
        }
        let slot = inner
            .files
            .get_mut(id as usize)
            .ok_or("file id is beyond the disk")?;
        if let Some(file) = slot.take() {
            file.lock().rewrite();
            debug!("deleted file {}", id);
        }
        Ok(())
    }
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}
