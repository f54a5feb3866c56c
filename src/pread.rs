//! Shared file descriptors serve every attached listener concurrently via
//! positional reads, never a shared file cursor. Unix and
//! Windows both expose a positional read primitive natively; the mutex
//! fallback below exists for the hypothetical platform that lacks one,
//! serializing `seek`+`read` pairs.

use std::fs::File;
use std::io;

#[cfg(not(any(unix, windows)))]
use parking_lot::Mutex;

#[derive(Debug)]
pub struct PositionalFile {
    file: File,
    #[cfg(not(any(unix, windows)))]
    seek_read_lock: Mutex<()>,
}

impl PositionalFile {
    pub fn open(path: &std::path::Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Ok(PositionalFile {
            file,
            #[cfg(not(any(unix, windows)))]
            seek_read_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    #[cfg(unix)]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset)
    }

    #[cfg(windows)]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.file.seek_read(buf, offset)
    }

    #[cfg(not(any(unix, windows)))]
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::io::{Read, Seek, SeekFrom};
        let _guard = self.seek_read_lock.lock();
        // SAFETY-equivalent: the lock above serializes every reader of this
        // fd so the seek+read pair below can't interleave with another.
        let file = &self.file;
        let mut file = file.try_clone()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }
}
