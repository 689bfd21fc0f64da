//! GUID partition table decoding.
//!
//! The header lives in LBA 1 and the entry array starts at LBA 2. Offsets and lengths are kept in
//! blocks; the caller scales them by the device block size.

use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use super::{decode_name, PartitionEntry, PartitionTable};
use crate::error::TableError;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_REVISION: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 0x5C;
const GPT_ENTRY_SIZE: usize = 128;

/// The primary table spans the protective MBR, the header and 32 blocks of entries.
const GPT_BACKUP_BLOCKS: u64 = 33;

pub const GPT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, PartialEq, Eq, DekuRead)]
#[deku(endian = "little")]
#[allow(dead_code)]
struct GptHeader {
    signature: [u8; 8],
    revision: u32,
    header_size: u32,
    header_crc: u32,
    reserved: u32,
    current_lba: u64,
    backup_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    entries_lba: u64,
    num_entries: u32,
    entry_size: u32,
    entries_crc: u32,
}

#[derive(Debug, PartialEq, Eq, DekuRead)]
#[deku(endian = "little")]
#[allow(dead_code)]
struct GptEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    first_lba: u64,
    last_lba: u64,
    attributes: u64,
    name: [u8; 72],
}

fn header_crc(header: &[u8]) -> u32 {
    let mut digest = GPT_CRC.digest();
    digest.update(&header[..16]);
    digest.update(&[0u8; 4]);
    digest.update(&header[20..GPT_HEADER_SIZE as usize]);
    digest.finalize()
}

/// Decode a GPT image whose block size is `block_size` bytes.
///
/// Besides one entry per table row, two synthetic partitions are produced: `0:GPT` covering the
/// primary table and `0:GPTBACKUP` covering the backup table at the end of the device.
pub fn parse_gpt(image: &[u8], block_size: u64) -> Result<PartitionTable, TableError> {
    let block_size = block_size as usize;
    let header_bytes = image
        .get(block_size..block_size + GPT_HEADER_SIZE as usize)
        .ok_or(TableError::Truncated(block_size))?;
    let (_, header) = GptHeader::from_bytes((header_bytes, 0))?;

    if &header.signature != GPT_SIGNATURE {
        return Err(TableError::GptSignature);
    }
    if header.revision != GPT_REVISION {
        return Err(TableError::GptRevision(header.revision));
    }
    if header.header_size != GPT_HEADER_SIZE {
        return Err(TableError::GptHeaderSize(header.header_size));
    }
    if header_crc(header_bytes) != header.header_crc {
        log::warn!("GPT header CRC mismatch, continuing anyway");
    }

    let mut table = PartitionTable::new();

    let end = header
        .first_usable_lba
        .checked_add(1)
        .ok_or_else(|| TableError::EntryRange("0:GPT".into()))?;
    table.insert(PartitionEntry {
        name: "0:GPT".into(),
        offset: header.current_lba.saturating_sub(1),
        length: end.saturating_sub(header.current_lba),
        device_index: 0,
    });

    let mut offset = 2 * block_size;
    for _ in 0..header.num_entries {
        let raw = image
            .get(offset..offset + GPT_ENTRY_SIZE)
            .ok_or(TableError::Truncated(offset))?;
        let (_, entry) = GptEntry::from_bytes((raw, 0))?;
        offset += GPT_ENTRY_SIZE;

        let name = decode_name(&entry.name);
        let end = match entry.last_lba.checked_add(1) {
            Some(end) => end,
            None => return Err(TableError::EntryRange(name)),
        };
        table.insert(PartitionEntry {
            name,
            offset: entry.first_lba,
            length: end.saturating_sub(entry.first_lba),
            device_index: 0,
        });
    }

    table.insert(PartitionEntry {
        name: "0:GPTBACKUP".into(),
        offset: header.backup_lba.saturating_sub(GPT_BACKUP_BLOCKS - 1),
        length: GPT_BACKUP_BLOCKS,
        device_index: 0,
    });

    Ok(table)
}

#[cfg(test)]
pub(crate) fn build_gpt(current_lba: u64, first_usable_lba: u64, backup_lba: u64, rows: &[(&str, u64, u64)]) -> Vec<u8> {
    use bytes::BufMut;

    let mut header = Vec::new();
    header.put_slice(GPT_SIGNATURE);
    header.put_u32_le(GPT_REVISION);
    header.put_u32_le(GPT_HEADER_SIZE);
    header.put_u32_le(0);
    header.put_u32_le(0);
    header.put_u64_le(current_lba);
    header.put_u64_le(backup_lba);
    header.put_u64_le(first_usable_lba);
    header.put_u64_le(backup_lba - 33);
    header.put_slice(&[0x5A; 16]);
    header.put_u64_le(2);
    header.put_u32_le(rows.len() as u32);
    header.put_u32_le(GPT_ENTRY_SIZE as u32);
    header.put_u32_le(0);
    let crc = header_crc(&header);
    header[16..20].copy_from_slice(&crc.to_le_bytes());

    let mut image = vec![0u8; 512];
    image.extend_from_slice(&header);
    image.resize(1024, 0);

    for (name, first, last) in rows {
        image.put_slice(&[0xA1; 16]);
        image.put_slice(&[0xB2; 16]);
        image.put_u64_le(*first);
        image.put_u64_le(*last);
        image.put_u64_le(0);
        let mut field = [0u8; 72];
        for (i, c) in name.encode_utf16().enumerate() {
            field[2 * i..2 * i + 2].copy_from_slice(&c.to_le_bytes());
        }
        image.put_slice(&field);
    }

    image
}

#[test]
fn test_gpt_synthetic_entries() -> anyhow::Result<()> {
    let image = build_gpt(2, 34, 1000, &[("0:HLOS", 34, 1057), ("rootfs", 1058, 9249)]);
    let table = parse_gpt(&image, 512)?;

    let names: Vec<_> = table.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["0:GPT", "0:HLOS", "rootfs", "0:GPTBACKUP"]);

    let gpt = table.get("0:GPT").unwrap();
    assert_eq!((gpt.offset, gpt.length), (1, 33));
    let backup = table.get("0:GPTBACKUP").unwrap();
    assert_eq!((backup.offset, backup.length), (968, 33));
    let hlos = table.get("0:HLOS").unwrap();
    assert_eq!((hlos.offset, hlos.length), (34, 1024));

    Ok(())
}

#[test]
fn test_gpt_bad_signature() {
    let mut image = build_gpt(2, 34, 1000, &[]);
    image[512] = b'X';
    assert!(matches!(parse_gpt(&image, 512), Err(TableError::GptSignature)));
}

#[test]
fn test_gpt_bad_revision_and_size() {
    let mut image = build_gpt(2, 34, 1000, &[]);
    image[512 + 8..512 + 12].copy_from_slice(&0x0002_0000u32.to_le_bytes());
    assert!(matches!(
        parse_gpt(&image, 512),
        Err(TableError::GptRevision(0x0002_0000))
    ));

    let mut image = build_gpt(2, 34, 1000, &[]);
    image[512 + 12..512 + 16].copy_from_slice(&0x60u32.to_le_bytes());
    assert!(matches!(
        parse_gpt(&image, 512),
        Err(TableError::GptHeaderSize(0x60))
    ));
}

#[test]
fn test_gpt_truncated() {
    let mut image = build_gpt(2, 34, 1000, &[("0:HLOS", 34, 1057)]);
    image.truncate(1024 + 64);
    assert!(matches!(parse_gpt(&image, 512), Err(TableError::Truncated(1024))));
    assert!(matches!(parse_gpt(&[0u8; 100], 512), Err(TableError::Truncated(512))));
}

#[test]
fn test_gpt_entry_past_last_block() {
    let image = build_gpt(2, 34, 1000, &[("0:HLOS", 34, u64::MAX)]);
    assert!(matches!(
        parse_gpt(&image, 512),
        Err(TableError::EntryRange(name)) if name == "0:HLOS"
    ));

    let image = build_gpt(2, u64::MAX, 1000, &[]);
    assert!(matches!(
        parse_gpt(&image, 512),
        Err(TableError::EntryRange(name)) if name == "0:GPT"
    ));
}
