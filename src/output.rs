use std::fs::File;
use std::io;

/// The destination block device or image file.
///
/// All engine writes are positional so the sink never depends on a shared
/// cursor; the FAT cache clones the underlying handle for its own window I/O.
pub struct Output {
    file: File,
}

impl Output {
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// actually read; a short count means the sink ends inside `buf`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        read_at(&self.file, buf, offset)
    }

    /// Write all of `buf` at `offset`, extending the sink if needed.
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        write_all_at(&self.file, buf, offset)
    }

    /// Duplicate the underlying handle (used by the FAT cache).
    pub(crate) fn clone_handle(&self) -> io::Result<File> {
        self.file.try_clone()
    }

    /// Sync and close the sink. On block devices the final flush can take
    /// noticeable time, so callers report completion only after this returns.
    pub fn finish(self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut total = 0usize;
    while total < buf.len() {
        let n = file.read_at(&mut buf[total..], offset + total as u64)?;
        if n == 0 {
            break; // EOF
        }
        total += n;
    }
    Ok(total)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(not(unix))]
pub(crate) fn read_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};

    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    let mut total = 0usize;
    while total < buf.len() {
        let n = f.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

#[cfg(not(unix))]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};

    let mut f = file;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(buf)
}
