//! Error types shared by the partition-table decoders and the resolution engine.
//!
//! Decoding errors are always fatal for the run. Validation errors abort packaging of a single
//! (board, flash type) combination; the caller decides how to report them.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TableError {
    #[error("invalid GPT signature")]
    GptSignature,
    #[error("unsupported GPT revision {0:#010x}")]
    GptRevision(u32),
    #[error("invalid GPT header size {0:#x}")]
    GptHeaderSize(u32),
    #[error("invalid partition table, magic bytes not present")]
    MibibHeaderMagic,
    #[error("unsupported MIBIB version {0}")]
    MibibHeaderVersion(u32),
    #[error("invalid system partition table, magic bytes not present")]
    MibibTableMagic,
    #[error("unsupported partition table version {0}")]
    MibibTableVersion(u32),
    #[error("partition '{0}' ends past the last addressable block")]
    EntryRange(String),
    #[error("partition image truncated at offset {0:#x}")]
    Truncated(usize),
    #[error("parse error")]
    Parse(#[from] deku::error::DekuError),
}

#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("img size is larger than part. len in '{label}' ({image}: {size} > {capacity})")]
    Oversize {
        label: String,
        image: String,
        size: u64,
        capacity: u64,
    },
    #[error("partition '{0}' not found in partition table")]
    MissingPartition(String),
    #[error("more than 2 NAND images for NOR+NAND is not allowed ({0} found)")]
    TooManySecondaryImages(usize),
    #[error("wifi firmware '{0}' not found")]
    MissingWifiFirmware(String),
}
