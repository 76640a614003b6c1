use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// Size of the master boot record sector.
pub const MBR_SIZE: usize = 512;

/// Boot signature bytes at offset 510.
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// On-disk MBR partition table entry (16 bytes).
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C)]
pub struct MbrEntry {
    pub boot_indicator: u8,
    pub start_chs: [u8; 3],
    pub partition_type: u8,
    pub end_chs: [u8; 3],
    pub block_offset: U32,
    pub block_count: U32,
}

/// On-disk MBR sector layout.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct MbrSector {
    bootstrap: [u8; 446],
    partitions: [MbrEntry; 4],
    signature: [u8; 2],
}

/// A decoded primary partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Partition {
    pub boot: bool,
    pub partition_type: u8,
    pub block_offset: u32,
    pub block_count: u32,
}

/// Decode the four primary partitions from a 512-byte MBR sector.
///
/// Returns `None` if the buffer is short or the boot signature is missing.
pub fn decode(buf: &[u8]) -> Option<[Partition; 4]> {
    let sector = MbrSector::ref_from_prefix(buf).ok()?.0;
    if sector.signature != BOOT_SIGNATURE {
        return None;
    }

    let mut partitions = [Partition::default(); 4];
    for (out, entry) in partitions.iter_mut().zip(&sector.partitions) {
        *out = Partition {
            boot: entry.boot_indicator & 0x80 != 0,
            partition_type: entry.partition_type,
            block_offset: entry.block_offset.get(),
            block_count: entry.block_count.get(),
        };
    }
    Some(partitions)
}

/// Encode a partition table into a fresh MBR sector.
///
/// Bytes 0..446 are left zero (no bootstrap code); CHS fields are zero since
/// every consumer of these images addresses partitions by LBA.
pub fn encode(partitions: &[Option<Partition>; 4]) -> [u8; MBR_SIZE] {
    let mut sector = MbrSector::new_zeroed();
    sector.signature = BOOT_SIGNATURE;

    for (entry, part) in sector.partitions.iter_mut().zip(partitions) {
        if let Some(part) = part {
            entry.boot_indicator = if part.boot { 0x80 } else { 0 };
            entry.partition_type = part.partition_type;
            entry.block_offset = U32::new(part.block_offset);
            entry.block_count = U32::new(part.block_count);
        }
    }

    let mut out = [0u8; MBR_SIZE];
    out.copy_from_slice(sector.as_bytes());
    out
}
