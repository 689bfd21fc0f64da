//! Run options and the per-SoC board configuration (`<src>/<arch>/config.xml`).

use anyhow::Context;

use std::path::{Path, PathBuf};

use crate::flash::{DeviceKind, FlashDeviceInfo, FlashType, EMMC_BLOCK_SIZE};
use crate::util::parse_int;
use crate::variant::{parse_axes, VersionAxis};
use crate::xml::Element;

/// Architectures the packer knows how to build for. A `_64` suffix selects the 64-bit images.
pub const SUPPORTED_ARCHS: &[&str] = &["ipq5332", "ipq5332_64"];

/// Default flash types when none are requested.
pub const DEFAULT_FLASH_TYPES: &str = "nor,tiny-nor,nand,norplusnand,emmc,norplusemmc";

/// Memory descriptor assumed for boards that don't name one.
pub const DEFAULT_MEMORY: &str = "128M16";

/// SoC hardware versions the script accepts, per architecture.
pub fn soc_hw_versions(arch: &str) -> &'static [u32] {
    match arch {
        "ipq5332" => &[0x201A_0100],
        _ => &[],
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    Bits32,
    Bits64,
}

impl Mode {
    /// The value layout descriptions use in `mode` attributes and `filename_<mode>` keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Bits32 => "32",
            Mode::Bits64 => "64",
        }
    }

    /// Suffix for output and configuration filenames.
    pub fn suffix(self) -> &'static str {
        match self {
            Mode::Bits32 => "",
            Mode::Bits64 => "_64",
        }
    }
}

/// Everything that stays fixed for one packing run.
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// SoC name, without the `_64` suffix
    pub arch: String,
    pub mode: Mode,
    /// Directory holding `<arch>/config.xml`, the layouts and the `mkimage`/`ubinize` tools
    pub src_dir: PathBuf,
    /// Directory holding the images to pack
    pub images_dir: PathBuf,
    pub out_dir: PathBuf,
    /// Only pack rows with this `image_type`, unless `all`
    pub image_type: String,
    /// Low-memory profile, selecting alternative CDT/bootloader/layout images
    pub memory: Option<String>,
    /// Pack ATF in place of TZ
    pub atf: bool,
    pub skip_4k_nand: bool,
    pub flash_types: Vec<FlashType>,
}

impl PackOptions {
    pub fn new(
        arch: &str,
        src_dir: impl Into<PathBuf>,
        images_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            SUPPORTED_ARCHS.contains(&arch),
            "invalid arch type '{arch}' (supported: {})",
            SUPPORTED_ARCHS.join("/")
        );

        let (arch, mode) = match arch.strip_suffix("_64") {
            Some(base) => (base, Mode::Bits64),
            None => (arch, Mode::Bits32),
        };

        Ok(Self {
            arch: arch.to_owned(),
            mode,
            src_dir: src_dir.into(),
            images_dir: images_dir.into(),
            out_dir: out_dir.into(),
            image_type: "all".into(),
            memory: None,
            atf: false,
            skip_4k_nand: false,
            flash_types: parse_flash_types(DEFAULT_FLASH_TYPES)?,
        })
    }

    pub fn is_all_images(&self) -> bool {
        self.image_type == "all"
    }

    /// Whether a row tagged `image_type` (if at all) passes the image-type filter.
    pub fn wants_image_type(&self, image_type: Option<&str>) -> bool {
        self.is_all_images() || image_type == Some(self.image_type.as_str())
    }

    pub fn config_path(&self) -> PathBuf {
        self.src_dir.join(&self.arch).join("config.xml")
    }

    pub fn layout_dir(&self) -> PathBuf {
        self.src_dir.join(&self.arch).join("flash_partition")
    }

    pub fn image_path(&self, filename: &str) -> PathBuf {
        self.images_dir.join(filename)
    }

    /// `<flash type>-<arch>[_64]-single.img`, or `-apps.img` when only HLOS images are packed.
    pub fn output_path(&self, flash_type: FlashType) -> PathBuf {
        let suffix = if self.image_type == "hlos" {
            "-apps.img"
        } else {
            "-single.img"
        };
        self.out_dir.join(format!(
            "{flash_type}-{}{}{suffix}",
            self.arch,
            self.mode.suffix()
        ))
    }
}

/// Parse a comma-separated list of flash types.
pub fn parse_flash_types(list: &str) -> anyhow::Result<Vec<FlashType>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<FlashType>)
        .collect()
}

/// One `MACH_ID_BOARD_MAP` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardEntry {
    pub machid: u64,
    pub board: String,
    pub memory: Option<String>,
    pub wififw_name: Option<String>,
    pub spi_nor: bool,
    /// The board boots a reduced first-stage bootloader
    pub tiny_image: bool,
}

impl BoardEntry {
    fn from_element(entry: &Element) -> anyhow::Result<Self> {
        let machid = entry
            .find_text("machid")
            .ok_or(anyhow::anyhow!("board entry has no machid"))?;
        let machid = parse_int(machid).context("invalid value for machid, should be integer")?;
        let board = entry
            .find_text("board")
            .ok_or(anyhow::anyhow!("board entry {machid:#x} has no board name"))?;

        Ok(Self {
            machid,
            board: board.to_owned(),
            memory: entry.find_text("memory").map(str::to_owned),
            wififw_name: entry.find_text("wififw_name").map(str::to_owned),
            spi_nor: entry.find_text("spi_nor") == Some("true"),
            tiny_image: entry.find("tiny_image").is_some(),
        })
    }

    /// The machine ID as the bootloader prints it.
    pub fn machid_hex(&self) -> String {
        format!("{:x}", self.machid)
    }

    pub fn memory(&self) -> &str {
        self.memory.as_deref().unwrap_or(DEFAULT_MEMORY)
    }

    /// Suffix naming the low-memory variant of per-board images, if a profile is selected.
    fn memory_suffix(profile: Option<&str>) -> String {
        profile.map(|m| format!("_LM{m}")).unwrap_or_default()
    }

    /// The CDT image for this board, and the label it's packed under.
    pub fn cdt(&self, profile: Option<&str>) -> (String, String) {
        let stem = format!("{}_{}", self.board, self.memory());
        (
            format!("cdt-{stem}{}.bin", Self::memory_suffix(profile)),
            format!("ddr-{stem}"),
        )
    }

    /// The reduced bootloader image for this board, and the label it's packed under.
    pub fn bootldr1(&self, profile: Option<&str>) -> (String, String) {
        let stem = format!("bootldr1_{}_{}", self.board, self.memory());
        (
            format!("{stem}{}.mbn", Self::memory_suffix(profile)),
            stem,
        )
    }
}

/// The parsed board configuration.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    root: Element,
    entries: Vec<BoardEntry>,
}

impl BoardConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        Self::from_root(Element::load(path)?)
    }

    pub fn from_root(root: Element) -> anyhow::Result<Self> {
        let entries = match root.find_with_attr("data", "type", "MACH_ID_BOARD_MAP") {
            Some(map) => map
                .children_named("entry")
                .map(BoardEntry::from_element)
                .collect::<anyhow::Result<_>>()?,
            None => Vec::new(),
        };

        Ok(Self { root, entries })
    }

    pub fn entries(&self) -> &[BoardEntry] {
        &self.entries
    }

    /// A `<data type="...">` block.
    pub fn parameter(&self, block: &str) -> Option<&Element> {
        self.root.find_with_attr("data", "type", block)
    }

    fn require(&self, block: &str) -> anyhow::Result<&Element> {
        self.parameter(block)
            .ok_or(anyhow::anyhow!("board configuration has no {block} block"))
    }

    /// Whether `NAND_PARAMETER` carries separate entries per page size.
    pub fn has_nand_page_variants(&self) -> bool {
        self.parameter("NAND_PARAMETER")
            .map_or(false, |nand| nand.child("entry").is_some())
    }

    fn nand_parameter(&self, is_4k: bool) -> anyhow::Result<&Element> {
        let nand = self.require("NAND_PARAMETER")?;
        if !self.has_nand_page_variants() {
            return Ok(nand);
        }

        let page = if is_4k { "4k" } else { "2k" };
        nand.child_with_attr("entry", "type", page)
            .ok_or(anyhow::anyhow!("NAND_PARAMETER has no {page} entry"))
    }

    fn read_geometry(block: &Element, kind: DeviceKind) -> anyhow::Result<FlashDeviceInfo> {
        let field = |name: &str| -> anyhow::Result<u64> {
            let text = block
                .find_text(name)
                .ok_or(anyhow::anyhow!("flash parameters have no {name}"))?;
            parse_int(text).with_context(|| format!("invalid flash info for {name}"))
        };

        Ok(FlashDeviceInfo::new(
            kind,
            field("page_size")?,
            field("pages_per_block")?,
            field("total_block")?,
        ))
    }

    /// Geometry of the boot flash for a non-eMMC pass.
    pub fn flash_device(&self, flash_type: FlashType) -> anyhow::Result<FlashDeviceInfo> {
        let block = match flash_type {
            FlashType::Nand | FlashType::Nand4k => self.nand_parameter(flash_type.is_4k())?,
            other => self.require(other.parameter_block())?,
        };
        Self::read_geometry(block, flash_type.device_kind())
    }

    /// Geometry MIBIB entries for the second flash are measured in.
    ///
    /// Falls back to the primary device when the board has no NAND.
    pub fn secondary_device(
        &self,
        flash_type: FlashType,
        primary: &FlashDeviceInfo,
    ) -> anyhow::Result<FlashDeviceInfo> {
        if self.parameter("NAND_PARAMETER").is_none() {
            return Ok(*primary);
        }
        Self::read_geometry(self.nand_parameter(flash_type.is_4k())?, DeviceKind::Nand)
    }

    /// The block describing the GPT images: `NORPLUSEMMC_PARAMETER` for NOR+eMMC, otherwise
    /// `EMMC_PARAMETER`.
    fn gpt_parameter(&self, flash_type: FlashType) -> anyhow::Result<&Element> {
        match flash_type {
            FlashType::NorPlusEmmc => self.require("NORPLUSEMMC_PARAMETER"),
            _ => self.require("EMMC_PARAMETER"),
        }
    }

    /// Geometry of the eMMC for an eMMC pass.
    pub fn emmc_device(&self, flash_type: FlashType) -> anyhow::Result<FlashDeviceInfo> {
        let page_size = match flash_type {
            FlashType::NorPlusEmmc => {
                let text = self
                    .require("NORPLUSEMMC_PARAMETER")?
                    .find_text("page_size_flash")
                    .ok_or(anyhow::anyhow!("NORPLUSEMMC_PARAMETER has no page_size_flash"))?;
                parse_int(text).context("invalid flash info for page_size_flash")?
            }
            _ => EMMC_BLOCK_SIZE,
        };

        let total = self
            .require("EMMC_PARAMETER")?
            .find_text("total_block")
            .ok_or(anyhow::anyhow!("EMMC_PARAMETER has no total_block"))?;
        let total = parse_int(total).context("invalid flash info for total_block")?;

        Ok(FlashDeviceInfo::emmc(page_size, total))
    }

    /// The primary GPT image.
    pub fn partition_mbn(&self, flash_type: FlashType) -> anyhow::Result<String> {
        self.gpt_parameter(flash_type)?
            .find_text("partition_mbn")
            .map(str::to_owned)
            .ok_or(anyhow::anyhow!("no partition_mbn for {flash_type}"))
    }

    /// The backup GPT image, if the board ships one.
    pub fn partition_mbn_backup(&self, flash_type: FlashType) -> anyhow::Result<Option<String>> {
        Ok(self
            .gpt_parameter(flash_type)?
            .find_text("partition_mbn_backup")
            .map(str::to_owned))
    }

    /// Firmware version axes, empty when version checks are not configured.
    pub fn version_axes(&self, arch: &str) -> anyhow::Result<Vec<VersionAxis>> {
        match self.parameter("VERSION_PARAMETER") {
            Some(block) => parse_axes(block, arch).context("invalid VERSION_PARAMETER"),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
pub(crate) const TEST_CONFIG: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<config>
    <data type="MACH_ID_BOARD_MAP">
        <entry>
            <machid>0x8060001</machid>
            <board>mi01.2</board>
            <memory>256M16</memory>
            <wififw_name>ipq5332_qcn9224_wifi_fw-squashfs.img</wififw_name>
            <spi_nor>true</spi_nor>
        </entry>
        <entry>
            <machid>0x8060002</machid>
            <board>mi01.3</board>
            <tiny_image/>
        </entry>
    </data>
    <data type="NAND_PARAMETER">
        <entry type="2k">
            <page_size>0x800</page_size>
            <pages_per_block>0x40</pages_per_block>
            <total_block>0x400</total_block>
        </entry>
        <entry type="4k">
            <page_size>0x1000</page_size>
            <pages_per_block>0x40</pages_per_block>
            <total_block>0x400</total_block>
        </entry>
    </data>
    <data type="NOR_PARAMETER">
        <page_size>0x100</page_size>
        <pages_per_block>0x100</pages_per_block>
        <total_block>0x100</total_block>
    </data>
    <data type="NORPLUSEMMC_PARAMETER">
        <page_size>0x100</page_size>
        <pages_per_block>0x100</pages_per_block>
        <total_block>0x100</total_block>
        <page_size_flash>0x200</page_size_flash>
        <partition_mbn>gpt_main1.bin</partition_mbn>
        <partition_mbn_backup>gpt_backup1.bin</partition_mbn_backup>
    </data>
    <data type="EMMC_PARAMETER">
        <total_block>0x1000000</total_block>
        <partition_mbn>gpt_main0.bin</partition_mbn>
        <partition_mbn_backup>gpt_backup0.bin</partition_mbn_backup>
    </data>
</config>
"#;

#[test]
fn test_options() -> anyhow::Result<()> {
    let opts = PackOptions::new("ipq5332_64", "/src", "/images", "/out")?;
    assert_eq!(opts.arch, "ipq5332");
    assert_eq!(opts.mode, Mode::Bits64);
    assert_eq!(opts.flash_types.len(), 6);
    assert_eq!(
        opts.output_path(FlashType::NorPlusNand),
        Path::new("/out/norplusnand-ipq5332_64-single.img")
    );
    assert_eq!(opts.config_path(), Path::new("/src/ipq5332/config.xml"));
    assert!(opts.wants_image_type(None));

    let mut opts = PackOptions::new("ipq5332", "/src", "/images", "/out")?;
    opts.image_type = "hlos".into();
    assert_eq!(opts.mode, Mode::Bits32);
    assert!(!opts.wants_image_type(None));
    assert!(opts.wants_image_type(Some("hlos")));
    assert_eq!(
        opts.output_path(FlashType::Emmc),
        Path::new("/out/emmc-ipq5332-apps.img")
    );

    assert!(PackOptions::new("ipq9574", "/src", "/images", "/out").is_err());
    Ok(())
}

#[test]
fn test_board_entries() -> anyhow::Result<()> {
    let config = BoardConfig::from_root(Element::parse(TEST_CONFIG)?)?;
    let entries = config.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].machid_hex(), "8060001");
    assert!(entries[0].spi_nor);
    assert!(!entries[0].tiny_image);
    assert!(entries[1].tiny_image);

    assert_eq!(
        entries[0].cdt(None),
        ("cdt-mi01.2_256M16.bin".to_owned(), "ddr-mi01.2_256M16".to_owned())
    );
    assert_eq!(
        entries[1].cdt(Some("512")),
        ("cdt-mi01.3_128M16_LM512.bin".to_owned(), "ddr-mi01.3_128M16".to_owned())
    );
    assert_eq!(
        entries[1].bootldr1(None),
        ("bootldr1_mi01.3_128M16.mbn".to_owned(), "bootldr1_mi01.3_128M16".to_owned())
    );
    Ok(())
}

#[test]
fn test_devices() -> anyhow::Result<()> {
    let config = BoardConfig::from_root(Element::parse(TEST_CONFIG)?)?;
    assert!(config.has_nand_page_variants());

    let nand = config.flash_device(FlashType::Nand)?;
    assert_eq!((nand.page_size, nand.block_size), (2048, 128 * 1024));
    let nand4k = config.flash_device(FlashType::Nand4k)?;
    assert_eq!(nand4k.page_size, 4096);

    let nor = config.flash_device(FlashType::TinyNor)?;
    assert_eq!(nor.kind, DeviceKind::Nor);
    assert_eq!(nor.chip_size, 16 * 1024 * 1024);
    assert_eq!(config.secondary_device(FlashType::Nor, &nor)?, nand);

    let emmc = config.emmc_device(FlashType::Emmc)?;
    assert_eq!((emmc.page_size, emmc.block_size), (512, 512));
    assert_eq!(config.emmc_device(FlashType::NorPlusEmmc)?.page_size, 0x200);

    assert_eq!(config.partition_mbn(FlashType::Emmc)?, "gpt_main0.bin");
    assert_eq!(
        config.partition_mbn_backup(FlashType::NorPlusEmmc)?.as_deref(),
        Some("gpt_backup1.bin")
    );
    assert!(config.version_axes("ipq5332")?.is_empty());

    // norplusnand has no parameter block in this configuration
    assert!(config.flash_device(FlashType::NorPlusNand).is_err());
    Ok(())
}
