use std::cell::RefCell;
use std::cmp;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use chrono::{Datelike, NaiveDateTime, Timelike};
use fatfs::{Date, DateTime, FileSystem, FormatVolumeOptions, FsOptions, Time, TimeProvider};
use log::debug;

use crate::error::ApplyError;
use crate::output::{self, Output};

pub const SECTOR_SIZE: u64 = 512;

/// Size of the write-back window staged in front of FAT mutations.
pub const FAT_CACHE_SIZE: usize = 12 * 1024 * 1024;

pub type FatVolume = FileSystem<FatCache>;

/// Hands the manifest creation date to the FAT layer so produced images are
/// bit-for-bit reproducible. Without a creation date, the FAT epoch is used.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeProvider {
    date: Date,
    time: Time,
}

impl FixedTimeProvider {
    pub fn new(creation_date: Option<NaiveDateTime>) -> Self {
        match creation_date {
            // FAT timestamps cover 1980..=2107; anything else falls back to
            // the epoch.
            Some(dt) if (1980..=2107).contains(&dt.year()) => Self {
                date: Date {
                    year: dt.year() as u16,
                    month: dt.month() as u16,
                    day: dt.day() as u16,
                },
                time: Time {
                    hour: dt.hour() as u16,
                    min: dt.minute() as u16,
                    sec: dt.second() as u16,
                    millis: 0,
                },
            },
            _ => Self {
                date: Date {
                    year: 1980,
                    month: 1,
                    day: 1,
                },
                time: Time {
                    hour: 0,
                    min: 0,
                    sec: 0,
                    millis: 0,
                },
            },
        }
    }
}

impl TimeProvider for FixedTimeProvider {
    fn get_current_date(&self) -> Date {
        self.date
    }

    fn get_current_date_time(&self) -> DateTime {
        DateTime {
            date: self.date,
            time: self.time,
        }
    }
}

struct CacheInner {
    file: File,
    /// Byte offset of the window on the sink.
    base: u64,
    window: Vec<u8>,
    /// Stream position, relative to `base`.
    pos: u64,
    dirty: bool,
}

/// Write-back cache over one partition's FAT region.
///
/// The window is read from the sink once at bind time; all in-window I/O is
/// served from memory and the whole window is written back on flush. I/O
/// past the window falls through to the sink directly. Cloning shares the
/// same cache, which is how the mounted [`FileSystem`] and the controller
/// both hold a handle.
#[derive(Clone)]
pub struct FatCache {
    inner: Rc<RefCell<CacheInner>>,
}

impl FatCache {
    fn init(output: &Output, base: u64, size: usize) -> io::Result<Self> {
        let file = output.clone_handle()?;
        let mut window = vec![0u8; size];
        // A short read means the sink ends inside the window; the remainder
        // stays zero, matching what a fresh image would contain.
        let preloaded = output.read_at(&mut window, base)?;
        debug!("FAT cache at byte offset {base}: {preloaded}/{size} bytes preloaded");
        Ok(Self {
            inner: Rc::new(RefCell::new(CacheInner {
                file,
                base,
                window,
                pos: 0,
                dirty: false,
            })),
        })
    }

    fn flush_to_sink(&self) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.dirty {
            output::write_all_at(&inner.file, &inner.window, inner.base)?;
            inner.dirty = false;
        }
        Ok(())
    }
}

impl Read for FatCache {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner.pos;
        let window_len = inner.window.len() as u64;
        let n = if pos < window_len {
            let start = pos as usize;
            let take = cmp::min(buf.len(), (window_len - pos) as usize);
            buf[..take].copy_from_slice(&inner.window[start..start + take]);
            take
        } else {
            let abs = inner.base + pos;
            output::read_at(&inner.file, buf, abs)?
        };
        inner.pos += n as u64;
        Ok(n)
    }
}

impl Write for FatCache {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner.pos;
        let window_len = inner.window.len() as u64;
        let n = if pos < window_len {
            let start = pos as usize;
            let take = cmp::min(buf.len(), (window_len - pos) as usize);
            inner.window[start..start + take].copy_from_slice(&buf[..take]);
            inner.dirty = true;
            take
        } else {
            let abs = inner.base + pos;
            output::write_all_at(&inner.file, buf, abs)?;
            buf.len()
        };
        inner.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_to_sink()
    }
}

impl Seek for FatCache {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut inner = self.inner.borrow_mut();
        let new = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::Current(d) => inner.pos as i128 + d as i128,
            SeekFrom::End(d) => {
                let end = (&inner.file).seek(SeekFrom::End(0))?;
                end.saturating_sub(inner.base) as i128 + d as i128
            }
        };
        if new < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of FAT region",
            ));
        }
        inner.pos = new as u64;
        Ok(inner.pos)
    }
}

struct Bound {
    block_offset: u64,
    cache: FatCache,
    /// Mounted lazily: `fat_mkfs` formats before anything can be mounted.
    fs: Option<FatVolume>,
    time: FixedTimeProvider,
}

/// Owns the at-most-one active FAT cache and its bind/flush lifecycle.
pub struct FatController {
    cache_size: usize,
    bound: Option<Bound>,
}

impl FatController {
    pub fn new(cache_size: usize) -> Self {
        Self {
            cache_size,
            bound: None,
        }
    }

    /// Bind the cache to a partition block offset (in 512-byte units).
    ///
    /// A negative offset flushes everything and leaves the controller idle.
    /// Binding the current offset is a no-op. Binding a different offset
    /// flushes and frees the current cache before initializing the new one.
    pub fn bind(
        &mut self,
        output: &Output,
        block_offset: i64,
        time: FixedTimeProvider,
    ) -> Result<(), ApplyError> {
        if let Some(bound) = &self.bound {
            if block_offset >= 0 && bound.block_offset == block_offset as u64 {
                return Ok(());
            }
        }
        self.unbind()?;
        if block_offset < 0 {
            return Ok(());
        }

        let block_offset = block_offset as u64;
        let cache = FatCache::init(output, block_offset * SECTOR_SIZE, self.cache_size)
            .map_err(ApplyError::FatCacheInit)?;
        self.bound = Some(Bound {
            block_offset,
            cache,
            fs: None,
            time,
        });
        Ok(())
    }

    /// Format a FAT volume of `total_sectors` 512-byte sectors through the
    /// bound cache.
    pub fn format(&mut self, total_sectors: u32) -> Result<(), ApplyError> {
        let bound = self.bound.as_mut().ok_or_else(no_cache)?;
        if let Some(fs) = bound.fs.take() {
            fs.unmount().map_err(ApplyError::Io)?;
        }
        let mut disk = bound.cache.clone();
        disk.seek(SeekFrom::Start(0))?;
        fatfs::format_volume(
            &mut disk,
            FormatVolumeOptions::new().total_sectors(total_sectors),
        )
        .map_err(ApplyError::Io)?;
        Ok(())
    }

    /// The mounted filesystem for the bound cache, mounting on first use.
    pub fn volume(&mut self) -> Result<&FatVolume, ApplyError> {
        let bound = self.bound.as_mut().ok_or_else(no_cache)?;
        if bound.fs.is_none() {
            let mut disk = bound.cache.clone();
            disk.seek(SeekFrom::Start(0))?;
            let time: &'static FixedTimeProvider = Box::leak(Box::new(bound.time));
            let fs = FileSystem::new(disk, FsOptions::new().time_provider(time))
                .map_err(ApplyError::Io)?;
            bound.fs = Some(fs);
        }
        Ok(bound.fs.as_ref().unwrap())
    }

    fn unbind(&mut self) -> Result<(), ApplyError> {
        if let Some(bound) = self.bound.take() {
            if let Some(fs) = bound.fs {
                fs.unmount().map_err(ApplyError::Io)?;
            }
            bound.cache.flush_to_sink().map_err(ApplyError::Io)?;
        }
        Ok(())
    }
}

fn no_cache() -> ApplyError {
    ApplyError::Action {
        action: "fat",
        msg: "no FAT cache is bound".into(),
    }
}
