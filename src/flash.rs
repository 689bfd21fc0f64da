//! Flash types and device geometry.

use std::fmt;
use std::str::FromStr;

use crate::table::PartitionEntry;

/// A flash arrangement an output image can be built for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FlashType {
    Nand,
    Nand4k,
    Nor,
    TinyNor,
    TinyNorDebug,
    Emmc,
    NorPlusNand,
    NorPlusNand4k,
    NorPlusEmmc,
}

impl FlashType {
    pub const ALL: [FlashType; 9] = [
        FlashType::Nand,
        FlashType::Nand4k,
        FlashType::Nor,
        FlashType::TinyNor,
        FlashType::TinyNorDebug,
        FlashType::Emmc,
        FlashType::NorPlusNand,
        FlashType::NorPlusNand4k,
        FlashType::NorPlusEmmc,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FlashType::Nand => "nand",
            FlashType::Nand4k => "nand-4k",
            FlashType::Nor => "nor",
            FlashType::TinyNor => "tiny-nor",
            FlashType::TinyNorDebug => "tiny-nor-debug",
            FlashType::Emmc => "emmc",
            FlashType::NorPlusNand => "norplusnand",
            FlashType::NorPlusNand4k => "norplusnand-4k",
            FlashType::NorPlusEmmc => "norplusemmc",
        }
    }

    /// The flash types whose rootfs and Wi-Fi firmware are carried in UBI volumes.
    pub fn is_nand_family(self) -> bool {
        matches!(
            self,
            FlashType::Nand | FlashType::Nand4k | FlashType::NorPlusNand | FlashType::NorPlusNand4k
        )
    }

    pub fn is_nor_plus_nand(self) -> bool {
        matches!(self, FlashType::NorPlusNand | FlashType::NorPlusNand4k)
    }

    pub fn is_tiny(self) -> bool {
        matches!(self, FlashType::TinyNor | FlashType::TinyNorDebug)
    }

    /// Uses the 4 KiB page entry of the NAND parameters.
    pub fn is_4k(self) -> bool {
        matches!(self, FlashType::Nand4k | FlashType::NorPlusNand4k)
    }

    /// The 4 KiB page companion built alongside this type, if any.
    pub fn companion_4k(self) -> Option<FlashType> {
        match self {
            FlashType::Nand => Some(FlashType::Nand4k),
            FlashType::NorPlusNand => Some(FlashType::NorPlusNand4k),
            _ => None,
        }
    }

    /// The kind of the device the bootloader boots from for this arrangement.
    pub fn device_kind(self) -> DeviceKind {
        match self {
            FlashType::Nand | FlashType::Nand4k => DeviceKind::Nand,
            FlashType::Emmc => DeviceKind::Emmc,
            FlashType::Nor
            | FlashType::TinyNor
            | FlashType::TinyNorDebug
            | FlashType::NorPlusNand
            | FlashType::NorPlusNand4k
            | FlashType::NorPlusEmmc => DeviceKind::Nor,
        }
    }

    /// Name of the parameter block describing the device in the board configuration.
    ///
    /// NAND and NAND-4k share `NAND_PARAMETER`; the page-size entry is picked separately.
    pub fn parameter_block(self) -> &'static str {
        match self {
            FlashType::Nand | FlashType::Nand4k => "NAND_PARAMETER",
            FlashType::Nor | FlashType::TinyNor | FlashType::TinyNorDebug => "NOR_PARAMETER",
            FlashType::Emmc => "EMMC_PARAMETER",
            FlashType::NorPlusNand | FlashType::NorPlusNand4k => "NORPLUSNAND_PARAMETER",
            FlashType::NorPlusEmmc => "NORPLUSEMMC_PARAMETER",
        }
    }
}

impl fmt::Display for FlashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FlashType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        FlashType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or(anyhow::anyhow!("invalid flash type '{s}'"))
    }
}

/// The physical device family a partition table describes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Nand,
    Nor,
    Emmc,
}

impl DeviceKind {
    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Nand => "nand",
            DeviceKind::Nor => "nor",
            DeviceKind::Emmc => "emmc",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pub-fields struct describing the geometry of a flash device. All sizes are in bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlashDeviceInfo {
    pub kind: DeviceKind,
    pub page_size: u64,
    pub block_size: u64,
    pub chip_size: u64,
}

/// eMMC partition tables count in 512-byte sectors.
pub const EMMC_BLOCK_SIZE: u64 = 512;

impl FlashDeviceInfo {
    pub fn new(kind: DeviceKind, page_size: u64, pages_per_block: u64, blocks_per_chip: u64) -> Self {
        let block_size = pages_per_block.saturating_mul(page_size);
        Self {
            kind,
            page_size,
            block_size,
            chip_size: blocks_per_chip.saturating_mul(block_size),
        }
    }

    pub fn emmc(page_size: u64, total_blocks: u64) -> Self {
        Self {
            kind: DeviceKind::Emmc,
            page_size,
            block_size: EMMC_BLOCK_SIZE,
            chip_size: total_blocks.saturating_mul(EMMC_BLOCK_SIZE),
        }
    }

    /// The number of bytes an image may occupy in the given partition.
    ///
    /// GPT entries are kept in blocks; index-block entries are already in bytes.
    pub fn capacity(&self, entry: &PartitionEntry) -> u64 {
        match self.kind {
            DeviceKind::Emmc => entry.length.saturating_mul(self.block_size),
            DeviceKind::Nand | DeviceKind::Nor => entry.length,
        }
    }
}

#[test]
fn test_flash_type_names() -> anyhow::Result<()> {
    for t in FlashType::ALL {
        assert_eq!(t.name().parse::<FlashType>()?, t);
    }
    assert!("sdcard".parse::<FlashType>().is_err());
    Ok(())
}

#[test]
fn test_nand_family() {
    let family: Vec<_> = FlashType::ALL
        .into_iter()
        .filter(|t| t.is_nand_family())
        .map(FlashType::name)
        .collect();
    assert_eq!(family, ["nand", "nand-4k", "norplusnand", "norplusnand-4k"]);
    assert_eq!(FlashType::NorPlusEmmc.device_kind(), DeviceKind::Nor);
    assert_eq!(FlashType::Nand4k.device_kind(), DeviceKind::Nand);
}

#[test]
fn test_capacity() {
    let entry = PartitionEntry {
        name: "rootfs".into(),
        offset: 0,
        length: 8,
        device_index: 0,
    };

    let emmc = FlashDeviceInfo::emmc(512, 0x1000);
    assert_eq!(emmc.capacity(&entry), 8 * 512);

    let nand = FlashDeviceInfo::new(DeviceKind::Nand, 2048, 64, 1024);
    assert_eq!(nand.block_size, 128 * 1024);
    assert_eq!(nand.chip_size, 128 * 1024 * 1024);
    assert_eq!(nand.capacity(&entry), 8);
}

#[test]
fn test_capacity_saturates() {
    let entry = PartitionEntry {
        name: "0:HLOS".into(),
        offset: 34,
        length: u64::MAX / 256,
        device_index: 0,
    };

    let emmc = FlashDeviceInfo::emmc(512, 0x1000);
    assert_eq!(emmc.capacity(&entry), u64::MAX);
}
