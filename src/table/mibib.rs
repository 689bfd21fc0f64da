//! MIBIB (multi-image boot information block) decoding.
//!
//! Page 0 of the block holds a small header, the partition table itself starts at page 1. Entry
//! offsets and lengths are counted in erase blocks of the flash they live on, and are converted
//! to bytes here.

use bytes::Buf;

use super::{decode_name, PartitionEntry, PartitionTable};
use crate::error::TableError;
use crate::flash::FlashDeviceInfo;

const HEADER_MAGIC1: u32 = 0xFE56_9FAC;
const HEADER_MAGIC2: u32 = 0xCD7F_127A;
const HEADER_VERSION: u32 = 4;

const TABLE_MAGIC1: u32 = 0x55EE_73AA;
const TABLE_MAGIC2: u32 = 0xE35E_BDDB;
const TABLE_VERSION: u32 = 4;

const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 28;
const NAME_SIZE: usize = 16;

/// A length of all-ones extends the partition to the end of its flash.
const LENGTH_TO_END: u32 = 0xFFFF_FFFF;

fn read_words(image: &[u8], offset: usize) -> Result<[u32; 4], TableError> {
    let mut buf = image
        .get(offset..offset + HEADER_SIZE)
        .ok_or(TableError::Truncated(offset))?;
    Ok([
        buf.get_u32_le(),
        buf.get_u32_le(),
        buf.get_u32_le(),
        buf.get_u32_le(),
    ])
}

/// Decode a MIBIB image.
///
/// `device` is the flash the table was read from; entries whose flash index is non-zero are
/// measured against `secondary` instead.
pub fn parse_mibib(
    image: &[u8],
    device: &FlashDeviceInfo,
    secondary: &FlashDeviceInfo,
) -> Result<PartitionTable, TableError> {
    let [magic1, magic2, version, _age] = read_words(image, 0)?;
    if (magic1, magic2) != (HEADER_MAGIC1, HEADER_MAGIC2) {
        return Err(TableError::MibibHeaderMagic);
    }
    if version != HEADER_VERSION {
        return Err(TableError::MibibHeaderVersion(version));
    }

    let table_offset = device.page_size as usize;
    let [magic1, magic2, version, numparts] = read_words(image, table_offset)?;
    if (magic1, magic2) != (TABLE_MAGIC1, TABLE_MAGIC2) {
        return Err(TableError::MibibTableMagic);
    }
    if version != TABLE_VERSION {
        return Err(TableError::MibibTableVersion(version));
    }

    let mut table = PartitionTable::new();
    let mut offset = table_offset + HEADER_SIZE;
    for _ in 0..numparts {
        let mut buf = image
            .get(offset..offset + ENTRY_SIZE)
            .ok_or(TableError::Truncated(offset))?;
        offset += ENTRY_SIZE;

        let mut name = [0u8; NAME_SIZE];
        buf.copy_to_slice(&mut name);
        let start = buf.get_u32_le();
        let length = buf.get_u32_le();
        buf.advance(3); // attributes
        let which_flash = buf.get_u8();

        let flash = if which_flash != 0 { secondary } else { device };
        let byte_offset = u64::from(start).saturating_mul(flash.block_size);
        let byte_length = if length == LENGTH_TO_END {
            flash.chip_size.saturating_sub(byte_offset)
        } else {
            u64::from(length).saturating_mul(flash.block_size)
        };

        table.insert(PartitionEntry {
            name: decode_name(&name),
            offset: byte_offset,
            length: byte_length,
            device_index: which_flash,
        });
    }

    Ok(table)
}

#[cfg(test)]
pub(crate) fn build_mibib(page_size: usize, rows: &[(&[u8], u32, u32, u8)]) -> Vec<u8> {
    use bytes::BufMut;

    let mut image = Vec::new();
    image.put_u32_le(HEADER_MAGIC1);
    image.put_u32_le(HEADER_MAGIC2);
    image.put_u32_le(HEADER_VERSION);
    image.put_u32_le(0);
    image.resize(page_size, 0xFF);

    image.put_u32_le(TABLE_MAGIC1);
    image.put_u32_le(TABLE_MAGIC2);
    image.put_u32_le(TABLE_VERSION);
    image.put_u32_le(rows.len() as u32);
    for (name, start, length, which_flash) in rows {
        let mut field = [0u8; NAME_SIZE];
        field[..name.len()].copy_from_slice(name);
        image.put_slice(&field);
        image.put_u32_le(*start);
        image.put_u32_le(*length);
        image.put_slice(&[0xFF, 0x01, 0x00]);
        image.put_u8(*which_flash);
    }

    image
}

#[cfg(test)]
fn test_devices() -> (FlashDeviceInfo, FlashDeviceInfo) {
    use crate::flash::DeviceKind;

    // 64 KiB blocks, 16 MiB NOR; 128 KiB blocks, 128 MiB NAND
    let nor = FlashDeviceInfo::new(DeviceKind::Nor, 256, 256, 256);
    let nand = FlashDeviceInfo::new(DeviceKind::Nand, 2048, 64, 1024);
    (nor, nand)
}

#[test]
fn test_mibib_entries() -> anyhow::Result<()> {
    let (nor, nand) = test_devices();
    assert_eq!(nor.chip_size, 0x100_0000);

    let image = build_mibib(
        256,
        &[
            (b"0:SBL1", 0, 3, 0),
            (b"0:MIBIB", 3, 1, 0),
            (b"rootfs", 0, LENGTH_TO_END, 1),
        ],
    );
    let table = parse_mibib(&image, &nor, &nand)?;
    assert_eq!(table.len(), 3);

    let mibib = table.get("0:MIBIB").unwrap();
    assert_eq!((mibib.offset, mibib.length), (3 * 0x10000, 0x10000));

    let rootfs = table.get("rootfs").unwrap();
    assert_eq!(rootfs.name.len(), 6);
    assert_eq!((rootfs.offset, rootfs.length), (0, nand.chip_size));
    assert_eq!(rootfs.device_index, 1);

    Ok(())
}

#[test]
fn test_mibib_length_to_end() -> anyhow::Result<()> {
    let (nor, nand) = test_devices();
    let image = build_mibib(256, &[(b"0:HLOS", 0, LENGTH_TO_END, 0), (b"0:ART", 4, LENGTH_TO_END, 0)]);
    let table = parse_mibib(&image, &nor, &nand)?;

    assert_eq!(table.get("0:HLOS").unwrap().length, 0x100_0000);
    assert_eq!(table.get("0:ART").unwrap().length, 0x100_0000 - 4 * 0x10000);
    Ok(())
}

#[test]
fn test_mibib_bad_magic() {
    let (nor, nand) = test_devices();

    let mut image = build_mibib(256, &[]);
    image[0] ^= 0xFF;
    assert!(matches!(
        parse_mibib(&image, &nor, &nand),
        Err(TableError::MibibHeaderMagic)
    ));

    let mut image = build_mibib(256, &[]);
    image[256 + 4] ^= 0xFF;
    assert!(matches!(
        parse_mibib(&image, &nor, &nand),
        Err(TableError::MibibTableMagic)
    ));

    let mut image = build_mibib(256, &[]);
    image[256 + 8] = 3;
    assert!(matches!(
        parse_mibib(&image, &nor, &nand),
        Err(TableError::MibibTableVersion(3))
    ));
}

#[test]
fn test_mibib_truncated() {
    let (nor, nand) = test_devices();
    let mut image = build_mibib(256, &[(b"0:SBL1", 0, 3, 0)]);
    image.truncate(256 + 16 + 10);
    assert!(matches!(
        parse_mibib(&image, &nor, &nand),
        Err(TableError::Truncated(272))
    ));
}

#[test]
fn test_mibib_header_version() {
    let (nor, nand) = test_devices();
    let mut image = build_mibib(256, &[(b"0:SBL1", 0, 3, 0)]);
    image[8..12].copy_from_slice(&3u32.to_le_bytes());
    assert!(matches!(
        parse_mibib(&image, &nor, &nand),
        Err(TableError::MibibHeaderVersion(3))
    ));
}
