//! Logical partition layouts (`<src>/<arch>/flash_partition/<type>-partition.xml`).
//!
//! NAND/NOR layouts describe each partition with child elements:
//!
//! ```xml
//! <partition>
//!     <name>0:QSEE</name>
//!     ...
//!     <img_name>tz.mbn</img_name>
//!     <img_name atf="true">bl31.mbn</img_name>
//! </partition>
//! ```
//!
//! eMMC layouts use attributes instead:
//!
//! ```xml
//! <partition label="0:QSEE" filename="tz.mbn" filename_atf="bl31.mbn"/>
//! ```

use std::path::PathBuf;

use crate::config::{Mode, PackOptions};
use crate::flash::{DeviceKind, FlashType};
use crate::xml::Element;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RowStyle {
    /// `<name>`/`<img_name>` children
    Element,
    /// `label`/`filename*` attributes
    Attribute,
}

/// A layout row that survived filtering, with its image selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutRow {
    pub partition: String,
    /// `None` when the row names no image, which only matters to slots that pick their own
    pub image: Option<String>,
}

/// The partition rows for one pass.
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    partitions: Vec<Element>,
    style: RowStyle,
}

/// The layout file for a pass over `device` while packing `flash_type`.
pub fn layout_path(opts: &PackOptions, flash_type: FlashType, device: DeviceKind) -> PathBuf {
    let name = if flash_type == FlashType::NorPlusEmmc && device == DeviceKind::Emmc {
        "emmc".to_owned()
    } else {
        flash_type.to_string()
    };
    opts.layout_dir().join(format!("{name}-partition.xml"))
}

impl PartitionLayout {
    pub fn load(opts: &PackOptions, flash_type: FlashType, device: DeviceKind) -> anyhow::Result<Self> {
        let root = Element::load(layout_path(opts, flash_type, device))?;
        Ok(Self::from_root(&root, flash_type, device))
    }

    /// Select the partitions describing `device` out of a layout document.
    pub fn from_root(root: &Element, flash_type: FlashType, device: DeviceKind) -> Self {
        let (partitions, style) = if device != DeviceKind::Emmc {
            let rows: Vec<&Element> = root
                .find_all("partitions")
                .into_iter()
                .flat_map(|p| p.children_named("partition"))
                .collect();
            (rows, RowStyle::Element)
        } else {
            let physical = if flash_type == FlashType::Emmc {
                "emmc"
            } else {
                "norplusemmc"
            };
            let rows: Vec<&Element> = root
                .find_with_attr("physical_partition", "ref", physical)
                .map(|p| p.children_named("partition").collect())
                .unwrap_or_default();
            (rows, RowStyle::Attribute)
        };

        Self {
            partitions: partitions.into_iter().cloned().collect(),
            style,
        }
    }

    fn element_name(partition: &Element) -> Option<&str> {
        partition.child("name").map(Element::text)
    }

    fn element_images(partition: &Element) -> Vec<&Element> {
        partition.children_named("img_name").collect()
    }

    /// First non-empty `<img_name>` of a row.
    fn first_image(partition: &Element) -> Option<&str> {
        partition
            .child("img_name")
            .map(Element::text)
            .filter(|i| !i.is_empty())
    }

    /// Image of the `0:MIBIB` row, regardless of filters.
    pub fn mibib_image(&self) -> Option<&str> {
        self.partitions
            .iter()
            .find(|p| Self::element_name(p) == Some("0:MIBIB"))
            .and_then(Self::first_image)
    }

    /// The image holding the partition table of a NAND/NOR device: the `0:MIBIB` row, or the
    /// second row when there is none.
    pub fn table_image(&self) -> Option<&str> {
        self.mibib_image()
            .or_else(|| self.partitions.get(1).and_then(Self::first_image))
    }

    /// The UBI image the `rootfs` row flashes for `mode`.
    pub fn rootfs_image(&self, mode: Mode) -> Option<&str> {
        let rootfs = self
            .partitions
            .iter()
            .find(|p| Self::element_name(p) == Some("rootfs"))?;
        let images = Self::element_images(rootfs);
        let index = match mode {
            Mode::Bits32 => 0,
            Mode::Bits64 => 1,
        };
        images.get(index).or(images.first()).copied().map(Element::text)
    }

    /// The rows that apply to this pass, with their images selected.
    pub fn rows(&self, opts: &PackOptions, flash_type: FlashType) -> Vec<LayoutRow> {
        self.partitions
            .iter()
            .filter_map(|p| match self.style {
                RowStyle::Element => Self::element_row(p, opts),
                RowStyle::Attribute => Self::attribute_row(p, opts, flash_type.is_tiny()),
            })
            .collect()
    }

    fn element_row(partition: &Element, opts: &PackOptions) -> Option<LayoutRow> {
        let name = Self::element_name(partition)?;
        let images = Self::element_images(partition);
        let first = images.first()?;
        if !opts.wants_image_type(first.attr("image_type")) {
            log::debug!("{name}: filtered out by image type");
            return None;
        }

        let mut image = first.text();
        if first.attr("mode").map_or(false, |m| m != opts.mode.as_str()) {
            match images.get(1) {
                Some(alt) => image = alt.text(),
                None => {
                    log::warn!("Skipping partition '{name}': no image for mode {}", opts.mode.as_str());
                    return None;
                }
            }
        }

        for img in &images {
            if img.attr("memory").is_some() && img.attr("memory") == opts.memory.as_deref() {
                image = img.text();
            }
            if img.attr("atf").is_some() && opts.atf {
                image = img.text();
            }
        }

        Some(LayoutRow {
            partition: name.to_owned(),
            image: Some(image.to_owned()).filter(|i| !i.is_empty()),
        })
    }

    fn attribute_row(partition: &Element, opts: &PackOptions, tiny: bool) -> Option<LayoutRow> {
        let label = partition.attr("label")?;
        if !opts.wants_image_type(partition.attr("image_type")) {
            log::debug!("{label}: filtered out by image type");
            return None;
        }

        let diff_files = partition.attr("diff_files") == Some("true");
        if tiny && !diff_files {
            return None;
        }

        let key = if diff_files {
            format!("filename_{}", opts.mode.as_str())
        } else {
            "filename".to_owned()
        };
        let image = match partition.attr(&key) {
            Some(image) => image,
            None => {
                log::warn!("Skipping partition '{label}'");
                ""
            }
        };

        let mut image = image.to_owned();
        if !image.is_empty() {
            if let Some(mem) = opts.memory.as_deref() {
                if let Some(alt) = partition.attr(&format!("filename_mem{mem}")) {
                    image = alt.to_owned();
                }
            }
            if opts.atf {
                if let Some(alt) = partition.attr("filename_atf") {
                    image = alt.to_owned();
                }
            }
        }

        Some(LayoutRow {
            partition: label.to_owned(),
            image: Some(image).filter(|i| !i.is_empty()),
        })
    }
}

#[cfg(test)]
pub(crate) const TEST_NAND_LAYOUT: &str = r#"<?xml version="1.0"?>
<nandboot>
    <partitions>
        <partition>
            <name>0:SBL1</name>
            <img_name>sbl1_nand.mbn</img_name>
        </partition>
        <partition>
            <name>0:MIBIB</name>
            <img_name>nand-system-partition-ipq5332.bin</img_name>
        </partition>
        <partition>
            <name>0:QSEE</name>
            <img_name>tz.mbn</img_name>
            <img_name atf="true">bl31.mbn</img_name>
        </partition>
        <partition>
            <name>0:CDT</name>
            <img_name>cdt.bin</img_name>
        </partition>
        <partition>
            <name>0:APPSBL</name>
            <img_name mode="32">openwrt-ipq5332-u-boot.mbn</img_name>
            <img_name>openwrt-ipq5332_64-u-boot.mbn</img_name>
        </partition>
        <partition>
            <name>rootfs</name>
            <img_name image_type="hlos">root.ubi</img_name>
            <img_name image_type="hlos">root_64.ubi</img_name>
        </partition>
    </partitions>
</nandboot>
"#;

#[cfg(test)]
pub(crate) const TEST_EMMC_LAYOUT: &str = r#"<?xml version="1.0"?>
<emmc>
    <physical_partition ref="norplusemmc">
        <partition label="0:HLOS" filename="kernel.img"/>
    </physical_partition>
    <physical_partition ref="emmc">
        <partition label="0:QSEE" filename="tz.mbn" filename_atf="bl31.mbn"/>
        <partition label="0:HLOS" diff_files="true" filename_32="kernel.img" filename_64="kernel_64.img" image_type="hlos"/>
        <partition label="0:WIFIFW"/>
        <partition label="0:ART" filename=""/>
        <partition label="rootfs" filename="rootfs.img" image_type="hlos"/>
    </physical_partition>
</emmc>
"#;

#[cfg(test)]
fn test_options() -> PackOptions {
    PackOptions::new("ipq5332", "/src", "/images", "/out").unwrap()
}

#[test]
fn test_element_rows() -> anyhow::Result<()> {
    let root = Element::parse(TEST_NAND_LAYOUT)?;
    let layout = PartitionLayout::from_root(&root, FlashType::Nand, DeviceKind::Nand);
    assert_eq!(layout.style, RowStyle::Element);
    assert_eq!(layout.mibib_image(), Some("nand-system-partition-ipq5332.bin"));
    assert_eq!(layout.table_image(), layout.mibib_image());
    assert_eq!(layout.rootfs_image(Mode::Bits64), Some("root_64.ubi"));

    let mut opts = test_options();
    let rows = layout.rows(&opts, FlashType::Nand);
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[2].image.as_deref(), Some("tz.mbn"));
    assert_eq!(rows[4].image.as_deref(), Some("openwrt-ipq5332-u-boot.mbn"));

    opts.mode = Mode::Bits64;
    opts.atf = true;
    let rows = layout.rows(&opts, FlashType::Nand);
    assert_eq!(rows[2].image.as_deref(), Some("bl31.mbn"));
    assert_eq!(rows[4].image.as_deref(), Some("openwrt-ipq5332_64-u-boot.mbn"));

    opts.image_type = "hlos".into();
    let rows = layout.rows(&opts, FlashType::Nand);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].partition, "rootfs");
    Ok(())
}

#[test]
fn test_attribute_rows() -> anyhow::Result<()> {
    let root = Element::parse(TEST_EMMC_LAYOUT)?;
    let layout = PartitionLayout::from_root(&root, FlashType::Emmc, DeviceKind::Emmc);
    assert_eq!(layout.style, RowStyle::Attribute);

    let mut opts = test_options();
    let rows = layout.rows(&opts, FlashType::Emmc);
    let summary: Vec<_> = rows
        .iter()
        .map(|r| (r.partition.as_str(), r.image.as_deref()))
        .collect();
    assert_eq!(
        summary,
        [
            ("0:QSEE", Some("tz.mbn")),
            ("0:HLOS", Some("kernel.img")),
            ("0:WIFIFW", None),
            ("0:ART", None),
            ("rootfs", Some("rootfs.img")),
        ]
    );

    opts.mode = Mode::Bits64;
    opts.atf = true;
    opts.image_type = "hlos".into();
    let rows = layout.rows(&opts, FlashType::Emmc);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].image.as_deref(), Some("kernel_64.img"));

    // Tiny NOR only takes rows that differ per mode
    let opts = test_options();
    let rows = layout.rows(&opts, FlashType::TinyNor);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].partition, "0:HLOS");

    let hybrid = PartitionLayout::from_root(&root, FlashType::NorPlusEmmc, DeviceKind::Emmc);
    assert_eq!(hybrid.rows(&opts, FlashType::NorPlusEmmc).len(), 1);
    Ok(())
}

#[test]
fn test_empty_table_image() -> anyhow::Result<()> {
    let root = Element::parse(
        r#"<nand><partitions>
            <partition><name>0:SBL1</name><img_name>sbl1.mbn</img_name></partition>
            <partition><name>0:MIBIB</name><img_name/></partition>
        </partitions></nand>"#,
    )?;
    let layout = PartitionLayout::from_root(&root, FlashType::Nand, DeviceKind::Nand);
    assert_eq!(layout.mibib_image(), None);
    // The fallback row is the MIBIB row itself, which is empty too
    assert_eq!(layout.table_image(), None);
    Ok(())
}
