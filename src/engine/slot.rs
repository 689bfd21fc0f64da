//! Slot classification and sub-image naming.

use crate::flash::{DeviceKind, FlashType};

/// What a partition slot is filled with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SlotKind {
    /// Primary GUID partition table
    Gpt,
    /// Backup GUID partition table
    GptBackup,
    /// The MIBIB; also re-read by the bootloader before anything else is flashed
    Mibib,
    /// Reduced first-stage bootloader, one image per board that needs it
    Bootldr1,
    /// DDR calibration data, one image per board
    Cdt,
    /// Wi-Fi firmware, one image per firmware family and version variant
    WifiFw,
    /// The row's own image
    Generic,
}

impl SlotKind {
    /// Classify a slot by partition name. Wi-Fi firmware only gets special handling on NOR and
    /// eMMC; NAND layouts carry it like any other image.
    pub fn classify(partition: &str, device: DeviceKind) -> Self {
        match section_label(partition).as_str() {
            "gpt" => SlotKind::Gpt,
            "gptbackup" => SlotKind::GptBackup,
            "mibib" => SlotKind::Mibib,
            "bootldr1" => SlotKind::Bootldr1,
            "cdt" | "ddrconfig" => SlotKind::Cdt,
            "wififw" if device != DeviceKind::Nand => SlotKind::WifiFw,
            _ => SlotKind::Generic,
        }
    }
}

/// The partition name without its `<n>:` prefix, lower-cased.
pub fn section_label(partition: &str) -> String {
    let label = match partition.split_once(':') {
        Some((_, label)) => label,
        None => partition,
    };
    label.to_lowercase()
}

/// The sub-image label a section is packed under.
pub fn alias(label: &str, flash_type: FlashType) -> String {
    match label {
        "qsee" => "tz",
        "appsbl" => "u-boot",
        "rootfs" if flash_type.is_nand_family() => "ubi",
        "wififw" if flash_type.is_nand_family() => "wififw_ubi",
        other => other,
    }
    .to_owned()
}

/// The sub-image label of a Wi-Fi firmware image: its filename without the squashfs suffix.
pub fn wifi_label(filename: &str) -> &str {
    filename.strip_suffix("-squashfs.img").unwrap_or(filename)
}

#[test]
fn test_alias() {
    for t in FlashType::ALL {
        assert_eq!(alias("qsee", t), "tz");
        assert_eq!(alias("appsbl", t), "u-boot");
        assert_eq!(alias("hlos", t), "hlos");
    }

    assert_eq!(alias("rootfs", FlashType::Nand), "ubi");
    assert_eq!(alias("rootfs", FlashType::NorPlusNand4k), "ubi");
    assert_eq!(alias("rootfs", FlashType::Emmc), "rootfs");
    assert_eq!(alias("rootfs", FlashType::NorPlusEmmc), "rootfs");
    assert_eq!(alias("wififw", FlashType::Nand4k), "wififw_ubi");
    assert_eq!(alias("wififw", FlashType::Nor), "wififw");
}

#[test]
fn test_classify() {
    assert_eq!(section_label("0:QSEE"), "qsee");
    assert_eq!(section_label("rootfs"), "rootfs");

    assert_eq!(SlotKind::classify("0:GPT", DeviceKind::Emmc), SlotKind::Gpt);
    assert_eq!(SlotKind::classify("0:GPTBACKUP", DeviceKind::Emmc), SlotKind::GptBackup);
    assert_eq!(SlotKind::classify("0:MIBIB", DeviceKind::Nand), SlotKind::Mibib);
    assert_eq!(SlotKind::classify("0:DDRCONFIG", DeviceKind::Nor), SlotKind::Cdt);
    assert_eq!(SlotKind::classify("0:BOOTLDR1", DeviceKind::Nor), SlotKind::Bootldr1);
    assert_eq!(SlotKind::classify("0:WIFIFW", DeviceKind::Emmc), SlotKind::WifiFw);
    assert_eq!(SlotKind::classify("0:WIFIFW", DeviceKind::Nor), SlotKind::WifiFw);
    assert_eq!(SlotKind::classify("0:WIFIFW", DeviceKind::Nand), SlotKind::Generic);
    assert_eq!(SlotKind::classify("0:HLOS", DeviceKind::Emmc), SlotKind::Generic);
}

#[test]
fn test_wifi_label() {
    assert_eq!(wifi_label("ipq5332_wifi_fw-squashfs.img"), "ipq5332_wifi_fw");
    assert_eq!(wifi_label("wifi_fw.img"), "wifi_fw.img");
}
