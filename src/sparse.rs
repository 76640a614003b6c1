use std::io::Read;

use sha2::{Digest, Sha256};

use crate::error::ApplyError;

/// Logical layout of a resource: alternating data/hole byte lengths,
/// starting with a data segment. A single entry means the resource is fully
/// dense. The archive stores only the data segments, concatenated; the map
/// is what puts them back at the right offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseMap(Vec<u64>);

impl SparseMap {
    pub fn new(entries: Vec<u64>) -> Result<Self, &'static str> {
        if entries.is_empty() {
            return Err("sparse map must have at least one entry");
        }
        Ok(Self(entries))
    }

    /// A fully dense map of the given size.
    pub fn dense(len: u64) -> Self {
        Self(vec![len])
    }

    pub fn entries(&self) -> &[u64] {
        &self.0
    }

    /// Bytes physically present in the archive (sum of data segments).
    pub fn data_size(&self) -> u64 {
        self.0.iter().step_by(2).sum()
    }

    /// Logical size of the resource (data plus holes).
    pub fn total_size(&self) -> u64 {
        self.0.iter().sum()
    }
}

/// One contiguous run of data addressed to a logical offset.
pub struct Chunk<'a> {
    pub offset: u64,
    pub data: &'a [u8],
}

/// Source of `(offset, data)` chunks for the current resource.
///
/// The returned slice stays valid only until the next call; successive
/// chunks are non-overlapping and strictly increasing in `offset`.
pub trait ChunkSource {
    fn next_chunk(&mut self) -> Result<Option<Chunk<'_>>, ApplyError>;
}

/// Splits a resource's concatenated archive payload back into sparse chunks.
///
/// The ZIP container cannot represent holes, so the build tool concatenates
/// all data segments into one payload and records the segmentation in the
/// manifest. This reader is the inverse: each consumed archive byte is
/// attributed to its logical offset, and bytes that cross a data-segment
/// boundary are held over (as a range into the scratch buffer) for the next
/// call.
pub struct SparseStream<'a> {
    source: &'a mut dyn Read,
    map: &'a [u64],
    buf: &'a mut [u8],
    /// Leftover bytes from the previous pull live at `buf[buf_pos..buf_len]`.
    buf_pos: usize,
    buf_len: usize,
    /// Index into the map; even when pointing at data, odd at a hole.
    map_index: usize,
    /// Bytes already produced from the current data segment.
    in_segment: u64,
    /// Current logical output offset.
    actual_offset: u64,
    hasher: Sha256,
    raw_len: u64,
}

impl<'a> SparseStream<'a> {
    pub fn new(map: &'a SparseMap, source: &'a mut dyn Read, buf: &'a mut [u8]) -> Self {
        let entries = map.entries();
        let mut map_index = 0;
        let mut actual_offset = 0;
        if entries[0] == 0 {
            if entries.len() > 2 {
                // Leading hole: skip the zero-length data segment and start
                // at the first real data offset.
                map_index = 2;
                actual_offset = entries[1];
            } else {
                // A zero-length data segment with no further data: either an
                // empty resource or one that is all hole. Signal EOF without
                // emitting anything (matching long-standing behavior for
                // completely sparse payloads).
                map_index = entries.len();
            }
        }

        Self {
            source,
            map: entries,
            buf,
            buf_pos: 0,
            buf_len: 0,
            map_index,
            in_segment: 0,
            actual_offset,
            hasher: Sha256::new(),
            raw_len: 0,
        }
    }

    /// Raw archive bytes pulled so far.
    pub fn raw_consumed(&self) -> u64 {
        self.raw_len
    }

    /// Check the running hash of the raw payload against an expected digest.
    pub fn verify_hash(&self, expected: &[u8; 32]) -> bool {
        let digest = self.hasher.clone().finalize();
        digest.as_slice() == expected
    }

    /// Advance past the hole that follows a finished data segment.
    fn advance_hole(&mut self) {
        self.map_index += 1;
        self.in_segment = 0;
        if self.map_index != self.map.len() {
            self.actual_offset += self.map[self.map_index];
            self.map_index += 1;
        }
    }
}

impl ChunkSource for SparseStream<'_> {
    fn next_chunk(&mut self) -> Result<Option<Chunk<'_>>, ApplyError> {
        if self.map_index == self.map.len() {
            return Ok(None);
        }
        let seg_len = self.map[self.map_index];
        let remaining = seg_len - self.in_segment;

        if self.buf_pos < self.buf_len {
            // Serve held-over bytes from the previous pull.
            let take = ((self.buf_len - self.buf_pos) as u64).min(remaining) as usize;
            let offset = self.actual_offset;
            let start = self.buf_pos;
            self.buf_pos += take;
            self.actual_offset += take as u64;
            self.in_segment += take as u64;
            if self.in_segment == seg_len {
                self.advance_hole();
            }
            return Ok(Some(Chunk {
                offset,
                data: &self.buf[start..start + take],
            }));
        }

        let n = self.source.read(self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.hasher.update(&self.buf[..n]);
        self.raw_len += n as u64;

        let offset = self.actual_offset;
        if (n as u64) < remaining {
            // Fully inside the current data segment.
            self.in_segment += n as u64;
            self.actual_offset += n as u64;
            self.buf_pos = n;
            self.buf_len = n;
            Ok(Some(Chunk {
                offset,
                data: &self.buf[..n],
            }))
        } else {
            // The pull reaches (or crosses) the end of the data segment:
            // emit the contiguous part and keep the rest as leftover.
            let emit = remaining as usize;
            self.actual_offset += remaining;
            self.buf_pos = emit;
            self.buf_len = n;
            self.advance_hole();
            Ok(Some(Chunk {
                offset,
                data: &self.buf[..emit],
            }))
        }
    }
}
