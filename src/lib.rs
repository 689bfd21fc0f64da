//! Packs Qualcomm IPQ firmware images into one bootloader-flashable blob per flash type.
//!
//! The blob carries every image plus a U-Boot script that extracts each one and writes it to the
//! right partition, checking the SoC revision and machine ID first. Partition geometry comes from
//! the same partition tables (GPT for eMMC, MIBIB for NAND/NOR) that the blob installs.

pub mod config;
pub mod engine;
pub mod error;
pub mod flash;
pub mod its;
pub mod layout;
pub mod manifest;
pub mod pack;
pub mod script;
pub mod table;
pub mod tools;
pub mod util;
pub mod variant;
pub mod xml;
