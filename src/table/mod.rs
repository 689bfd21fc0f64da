//! Decoders for the two on-flash partition table formats: the GUID partition table used on eMMC,
//! and the MIBIB index block used on NAND/NOR.

pub mod gpt;
pub mod mibib;

use anyhow::Context;

use std::fs;
use std::path::Path;

use crate::flash::{DeviceKind, FlashDeviceInfo};

pub use gpt::parse_gpt;
pub use mibib::parse_mibib;

/// A single named partition.
///
/// GPT entries are kept in device blocks; MIBIB entries are kept in bytes. Use
/// [`FlashDeviceInfo::capacity`] to compare against image sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    pub name: String,
    pub offset: u64,
    pub length: u64,
    /// 0 for the primary flash, non-zero for the secondary (e.g. NAND side of NOR+NAND)
    pub device_index: u8,
}

/// An ordered map of partition name to entry.
///
/// Inserting a name that is already present replaces the old entry but keeps its position.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: PartitionEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Read and decode the partition image at `path`, picking the format from the device kind.
    ///
    /// `secondary` is the geometry MIBIB entries flagged for the second flash are measured in;
    /// it is ignored for GPT.
    pub fn load<P: AsRef<Path>>(
        path: P,
        device: &FlashDeviceInfo,
        secondary: &FlashDeviceInfo,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let image =
            fs::read(path).with_context(|| format!("error opening {}", path.display()))?;

        let table = match device.kind {
            DeviceKind::Emmc => parse_gpt(&image, device.block_size),
            DeviceKind::Nand | DeviceKind::Nor => parse_mibib(&image, device, secondary),
        }
        .with_context(|| format!("error decoding {}", path.display()))?;

        for entry in table.iter() {
            log::debug!(
                "partition {:>16} offset {:#x} length {:#x} flash {}",
                entry.name,
                entry.offset,
                entry.length,
                entry.device_index
            );
        }

        Ok(table)
    }
}

/// Recover a partition name from a fixed-width, NUL-padded field.
///
/// Every NUL is dropped, not only the trailing padding.
pub(crate) fn decode_name(field: &[u8]) -> String {
    let bytes: Vec<u8> = field.iter().copied().filter(|&b| b != 0).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[test]
fn test_table_last_write_wins() {
    let mut table = PartitionTable::new();
    for (name, offset) in [("0:SBL1", 0), ("0:MIBIB", 1), ("0:SBL1", 2)] {
        table.insert(PartitionEntry {
            name: name.into(),
            offset,
            length: 1,
            device_index: 0,
        });
    }

    assert_eq!(table.len(), 2);
    assert_eq!(table.get("0:SBL1").map(|e| e.offset), Some(2));
    let names: Vec<_> = table.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["0:SBL1", "0:MIBIB"]);
    assert!(table.get("rootfs").is_none());
}

#[test]
fn test_decode_name() {
    assert_eq!(decode_name(b"rootfs\0\0\0\0\0\0\0\0\0\0"), "rootfs");
    // UTF-16LE names in GPT entries come out as ASCII once the NULs are gone
    assert_eq!(decode_name(b"0\0:\0H\0L\0O\0S\0\0\0"), "0:HLOS");
}
