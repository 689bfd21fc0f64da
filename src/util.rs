//! Useful traits and other utilities that don't really belong anywhere else.

use sha1::{Digest, Sha1};

use std::io::{self, Read};

pub trait ReadExt {
    /// Tries to read exactly `read_len` bytes, like `read_exact`, but unlike `read_exact`, is
    /// forgiving of unexpected EOF.
    ///
    /// The returned vector will have exactly `read_len` bytes appended, unless an EOF was
    /// encountered, in which case it will have strictly shorter than `read_len` new bytes added.
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()>;
}

impl<T: Read> ReadExt for T {
    fn read_to_vec(&mut self, vec: &mut Vec<u8>, read_len: usize) -> io::Result<()> {
        const CHUNK_SIZE: usize = 65536;

        let read_len = read_len + vec.len();
        let mut cursor = vec.len();
        while cursor < read_len {
            vec.resize(std::cmp::min(read_len, cursor + CHUNK_SIZE), 0u8);

            cursor += match self.read(&mut vec[cursor..]) {
                Ok(0) => {
                    vec.truncate(cursor);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
                Err(x) => return Err(x),
            };
        }

        Ok(())
    }
}

/// Parse an integer the way the board configuration writes them: decimal, or with a `0x`, `0o`
/// or `0b` radix prefix.
pub fn parse_int(value: &str) -> anyhow::Result<u64> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();
    let (digits, radix) = if let Some(hex) = lower.strip_prefix("0x") {
        (hex, 16)
    } else if let Some(oct) = lower.strip_prefix("0o") {
        (oct, 8)
    } else if let Some(bin) = lower.strip_prefix("0b") {
        (bin, 2)
    } else {
        (lower.as_str(), 10)
    };

    u64::from_str_radix(digits, radix).map_err(|e| anyhow::anyhow!("invalid integer '{value}': {e}"))
}

/// Hex-encoded SHA1 digest of a string, used to make sub-image labels unique per file.
pub fn sha1_hex(message: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(message.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[test]
fn test_read_to_vec() -> io::Result<()> {
    let mut vec = Vec::new();
    io::repeat(0xAA).read_to_vec(&mut vec, 4)?;
    assert_eq!(vec, [0xAA; 4]);
    (&[1, 2, 3][..]).read_to_vec(&mut vec, 8)?;
    assert_eq!(vec, [0xAA, 0xAA, 0xAA, 0xAA, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_parse_int() -> anyhow::Result<()> {
    assert_eq!(parse_int("0x8060001")?, 0x8060001);
    assert_eq!(parse_int("0X1F")?, 0x1F);
    assert_eq!(parse_int(" 2048 ")?, 2048);
    assert_eq!(parse_int("0b101")?, 5);
    assert!(parse_int("abc").is_err());
    Ok(())
}

#[test]
fn test_sha1_hex() {
    assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    assert_eq!(sha1_hex("").len(), 40);
}
