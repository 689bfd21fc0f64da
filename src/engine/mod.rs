//! Partition resolution: deciding which image goes into which partition.
//!
//! One pass walks the slots of a layout for one flash device and produces a [`BoardPlan`]. The
//! plan is then consumed twice: once to emit the flashing script ([`emit`]) and once to collect
//! the images to pack ([`crate::manifest`]). Both consumers see the same decisions, so every
//! image the script extracts is packed and nothing else is.

pub mod emit;
pub mod slot;

use anyhow::Context;

use std::fs;

use crate::config::{soc_hw_versions, BoardConfig, BoardEntry, PackOptions};
use crate::error::ValidationError;
use crate::flash::{DeviceKind, FlashDeviceInfo, FlashType};
use crate::layout::{LayoutRow, PartitionLayout};
use crate::table::{PartitionEntry, PartitionTable};
use crate::util::sha1_hex;
use crate::variant::VariantResolver;

pub use emit::emit;
pub use slot::{alias, section_label, wifi_label, SlotKind};

/// Wi-Fi firmware is flashed into this UBI volume on NAND-backed systems.
const WIFI_UBI_VOLUME: &str = "wifi_fw";

/// An image file and the label it is packed under (before the filename hash is appended).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub label: String,
    pub filename: String,
}

impl ImageRef {
    pub fn new(label: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            filename: filename.into(),
        }
    }

    /// The sub-image name in the packed blob, unique per file.
    pub fn packed_label(&self) -> String {
        format!("{}-{}", self.label, sha1_hex(&self.filename))
    }
}

/// One resolved action of a flashing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Extract an image and write it to a partition
    Flash { image: ImageRef, partition: String },
    /// Extract the MIBIB (if it has content) and make the bootloader re-read its partitions
    MibibReload {
        image: Option<ImageRef>,
        device: FlashDeviceInfo,
    },
    /// Probe the radios so the firmware version variables are set
    DetectVersions,
    /// Run `steps` only on the listed machines
    MachidGuard { machids: Vec<String>, steps: Vec<Step> },
    /// Run `steps` only when the version variables match; `guard` opens `depth` conditionals
    VersionGuard {
        guard: String,
        depth: usize,
        steps: Vec<Step>,
    },
}

impl Step {
    /// Every image this step (and anything nested in it) extracts, with its target partition.
    pub fn images(&self) -> Vec<(&ImageRef, Option<&str>)> {
        match self {
            Step::Flash { image, partition } => vec![(image, Some(partition.as_str()))],
            Step::MibibReload { image, .. } => image.iter().map(|i| (i, None)).collect(),
            Step::DetectVersions => Vec::new(),
            Step::MachidGuard { steps, .. } | Step::VersionGuard { steps, .. } => {
                steps.iter().flat_map(Step::images).collect()
            }
        }
    }
}

/// Everything one pass decided, in script order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardPlan {
    pub device: FlashDeviceInfo,
    /// Accepted SoC hardware versions
    pub soc_versions: Vec<u32>,
    /// Every machine the configuration knows
    pub machids: Vec<String>,
    /// `flashinit` argument, if the flash needs initialising
    pub flashinit: Option<&'static str>,
    pub steps: Vec<Step>,
    /// Whether the script ends after this pass
    pub terminate: bool,
}

impl BoardPlan {
    /// Every image the plan extracts, in order, with its target partition.
    pub fn images(&self) -> Vec<(&ImageRef, Option<&str>)> {
        self.steps.iter().flat_map(Step::images).collect()
    }
}

/// The inputs of one pass over one flash device.
#[derive(Debug, Clone, Copy)]
pub struct Pass<'a> {
    pub flash_type: FlashType,
    pub device: FlashDeviceInfo,
    pub table: &'a PartitionTable,
    pub layout: &'a PartitionLayout,
    /// The last pass of a flash type ends the script
    pub terminate: bool,
}

/// Walks layout slots against the board configuration and a decoded partition table.
pub struct PartitionResolutionEngine<'a> {
    opts: &'a PackOptions,
    config: &'a BoardConfig,
    resolver: &'a mut VariantResolver,
}

/// State that lives for the duration of one pass.
struct PassState<'p> {
    pass: Pass<'p>,
    /// Images assigned to partitions the table doesn't have
    unplaced: usize,
}

impl<'a> PartitionResolutionEngine<'a> {
    pub fn new(
        opts: &'a PackOptions,
        config: &'a BoardConfig,
        resolver: &'a mut VariantResolver,
    ) -> Self {
        Self {
            opts,
            config,
            resolver,
        }
    }

    /// Resolve every slot of a pass into a plan.
    ///
    /// Fails with a [`ValidationError`] when an image does not fit its partition, or when a
    /// partition the layout needs is missing from the table.
    pub fn plan(&mut self, pass: Pass<'_>) -> anyhow::Result<BoardPlan> {
        let mut state = PassState { pass, unplaced: 0 };
        let flash_type = pass.flash_type;
        let kind = pass.device.kind;

        let flashinit = if kind == DeviceKind::Nand || flash_type.is_nor_plus_nand() {
            Some("nand")
        } else if kind == DeviceKind::Emmc || flash_type == FlashType::NorPlusEmmc {
            Some("mmc")
        } else {
            None
        };

        let mut steps = Vec::new();
        if kind != DeviceKind::Emmc {
            if let Some(mibib) = pass.layout.mibib_image() {
                let image = (self.image_size(mibib)? > 0).then(|| ImageRef::new("mibib", mibib));
                steps.push(Step::MibibReload {
                    image,
                    device: pass.device,
                });
            }
        }

        let gpt_slots = kind == DeviceKind::Emmc && self.opts.is_all_images();
        if gpt_slots {
            let filename = self.config.partition_mbn(flash_type)?;
            self.resolve_image(&mut state, "0:GPT", &filename, &mut steps)?;
        }

        for row in pass.layout.rows(self.opts, flash_type) {
            self.resolve_row(&mut state, &row, &mut steps)?;
        }

        if gpt_slots {
            if let Some(filename) = self.config.partition_mbn_backup(flash_type)? {
                self.resolve_image(&mut state, "0:GPTBACKUP", &filename, &mut steps)?;
            }
        }

        Ok(BoardPlan {
            device: pass.device,
            soc_versions: soc_hw_versions(&self.opts.arch).to_vec(),
            machids: self.config.entries().iter().map(BoardEntry::machid_hex).collect(),
            flashinit,
            steps,
            terminate: pass.terminate,
        })
    }

    fn resolve_row(
        &mut self,
        state: &mut PassState<'_>,
        row: &LayoutRow,
        steps: &mut Vec<Step>,
    ) -> anyhow::Result<()> {
        let kind = SlotKind::classify(&row.partition, state.pass.device.kind);
        log::debug!("slot {} ({kind:?}) image {:?}", row.partition, row.image);

        match kind {
            SlotKind::Gpt | SlotKind::GptBackup | SlotKind::Mibib | SlotKind::Generic => {
                if let Some(image) = &row.image {
                    self.resolve_image(state, &row.partition, image, steps)?;
                }
            }
            SlotKind::Cdt => {
                let boards: Vec<_> = self.config.entries().to_vec();
                self.resolve_per_board(state, &row.partition, &boards, steps, |b, profile| {
                    b.cdt(profile)
                })?;
            }
            SlotKind::Bootldr1 => {
                let boards: Vec<_> = self
                    .config
                    .entries()
                    .iter()
                    .filter(|b| b.tiny_image)
                    .cloned()
                    .collect();
                self.resolve_per_board(state, &row.partition, &boards, steps, |b, profile| {
                    b.bootldr1(profile)
                })?;
            }
            SlotKind::WifiFw => {
                if self.resolver.is_active() {
                    steps.push(Step::DetectVersions);
                }

                let ubi = state.pass.device.kind != DeviceKind::Emmc;
                let generic: Vec<String> = self
                    .config
                    .entries()
                    .iter()
                    .filter(|b| b.wififw_name.is_none())
                    .map(BoardEntry::machid_hex)
                    .collect();
                if let Some(image) = row.image.as_deref().filter(|i| !is_none(i)) {
                    if !generic.is_empty() {
                        self.resolve_wifi(state, &row.partition, image, generic, ubi, steps)?;
                    }
                }

                self.resolve_wifi_families(state, &row.partition, ubi, steps)?;
            }
        }

        // Wi-Fi firmware rides along with the rootfs UBI image
        if state.pass.flash_type.is_nand_family() && row.partition == "rootfs" {
            if self.resolver.is_active() {
                steps.push(Step::DetectVersions);
            }
            self.resolve_wifi_families(state, &row.partition, true, steps)?;
        }

        Ok(())
    }

    /// Size of an image in the images directory; `none` stands for no image.
    fn image_size(&self, filename: &str) -> anyhow::Result<u64> {
        if is_none(filename) {
            return Ok(0);
        }

        let path = self.opts.image_path(filename);
        let metadata = fs::metadata(&path)
            .with_context(|| format!("error getting image size '{filename}'"))?;
        Ok(metadata.len())
    }

    /// Look up a partition, applying the missing-partition policy of the flash type.
    ///
    /// `Ok(None)` means the slot is skipped.
    fn lookup<'t>(
        &self,
        state: &mut PassState<'t>,
        partition: &str,
    ) -> Result<Option<&'t PartitionEntry>, ValidationError> {
        if let Some(entry) = state.pass.table.get(partition) {
            return Ok(Some(entry));
        }

        match state.pass.flash_type {
            FlashType::NorPlusEmmc => {
                log::debug!("{partition}: not on this device, skipping");
                Ok(None)
            }
            FlashType::NorPlusNand | FlashType::NorPlusNand4k if !partition.starts_with("0:") => {
                state.unplaced += 1;
                if state.unplaced > 2 {
                    return Err(ValidationError::TooManySecondaryImages(state.unplaced));
                }
                log::debug!("{partition}: not in the NOR table, skipping");
                Ok(None)
            }
            _ => Err(ValidationError::MissingPartition(partition.to_owned())),
        }
    }

    fn check_capacity(
        &self,
        state: &PassState<'_>,
        label: &str,
        filename: &str,
        size: u64,
        entry: &PartitionEntry,
    ) -> Result<(), ValidationError> {
        let capacity = state.pass.device.capacity(entry);
        if size > capacity {
            return Err(ValidationError::Oversize {
                label: label.to_owned(),
                image: filename.to_owned(),
                size,
                capacity,
            });
        }
        Ok(())
    }

    /// A slot filled with one image.
    fn resolve_image(
        &mut self,
        state: &mut PassState<'_>,
        partition: &str,
        filename: &str,
        steps: &mut Vec<Step>,
    ) -> anyhow::Result<()> {
        if is_none(filename) {
            return Ok(());
        }

        let Some(entry) = self.lookup(state, partition)? else {
            return Ok(());
        };

        let label = section_label(partition);
        let size = self.image_size(filename)?;
        self.check_capacity(state, &label, filename, size, entry)?;
        if size == 0 {
            return Ok(());
        }

        steps.push(Step::Flash {
            image: ImageRef::new(alias(&label, state.pass.flash_type), filename),
            partition: entry.name.clone(),
        });
        Ok(())
    }

    /// A slot filled with one image per board, guarded by machine ID.
    fn resolve_per_board<F>(
        &mut self,
        state: &mut PassState<'_>,
        partition: &str,
        boards: &[BoardEntry],
        steps: &mut Vec<Step>,
        image_for: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(&BoardEntry, Option<&str>) -> (String, String),
    {
        if boards.is_empty() {
            return Ok(());
        }
        let Some(entry) = self.lookup(state, partition)? else {
            return Ok(());
        };

        let section = section_label(partition);
        for board in boards {
            let (filename, label) = image_for(board, self.opts.memory.as_deref());
            let size = self.image_size(&filename)?;
            self.check_capacity(state, &section, &filename, size, entry)?;
            if size == 0 {
                continue;
            }

            steps.push(Step::MachidGuard {
                machids: vec![board.machid_hex()],
                steps: vec![Step::Flash {
                    image: ImageRef::new(label, filename),
                    partition: entry.name.clone(),
                }],
            });
        }

        Ok(())
    }

    /// Machine IDs of the boards carrying Wi-Fi firmware `name`.
    fn wifi_machids(&self, flash_type: FlashType, name: &str) -> Vec<String> {
        self.config
            .entries()
            .iter()
            .filter(|b| b.wififw_name.as_deref() == Some(name))
            .filter(|b| flash_type != FlashType::Nor || b.spi_nor)
            .map(BoardEntry::machid_hex)
            .collect()
    }

    /// Wi-Fi firmware families named by the boards, in first-seen order.
    fn wifi_families(&self) -> Vec<String> {
        let mut families: Vec<String> = Vec::new();
        for name in self.config.entries().iter().filter_map(|b| b.wififw_name.as_ref()) {
            if !name.is_empty() && !families.contains(name) {
                families.push(name.clone());
            }
        }
        families
    }

    fn resolve_wifi_families(
        &mut self,
        state: &mut PassState<'_>,
        partition: &str,
        ubi: bool,
        steps: &mut Vec<Step>,
    ) -> anyhow::Result<()> {
        for family in self.wifi_families() {
            let machids = self.wifi_machids(state.pass.flash_type, &family);
            if !machids.is_empty() {
                self.resolve_wifi(state, partition, &family, machids, ubi, steps)?;
            }
        }
        Ok(())
    }

    /// Wi-Fi firmware `template` for the given machines, expanded into its version variants.
    ///
    /// With `ubi`, the firmware goes into the Wi-Fi UBI volume; otherwise into `partition`.
    fn resolve_wifi(
        &mut self,
        state: &mut PassState<'_>,
        partition: &str,
        template: &str,
        machids: Vec<String>,
        ubi: bool,
        steps: &mut Vec<Step>,
    ) -> anyhow::Result<()> {
        let variants: Vec<(String, Option<(String, usize)>)> = if self.resolver.is_active() {
            self.resolver
                .resolve(template, &self.opts.images_dir)
                .into_iter()
                .map(|v| (v.filename, Some((v.guard, v.depth))))
                .collect()
        } else {
            if !self.opts.image_path(template).exists() {
                return Err(ValidationError::MissingWifiFirmware(template.to_owned()).into());
            }
            vec![(template.to_owned(), None)]
        };

        let mut guarded = Vec::new();
        for (filename, guard) in variants {
            let image = ImageRef::new(wifi_label(&filename), filename.as_str());
            let flash = if ubi {
                Step::Flash {
                    image,
                    partition: WIFI_UBI_VOLUME.to_owned(),
                }
            } else {
                let Some(entry) = self.lookup(state, partition)? else {
                    continue;
                };
                let size = self.image_size(&filename)?;
                self.check_capacity(state, &section_label(partition), &filename, size, entry)?;
                if size == 0 {
                    continue;
                }
                Step::Flash {
                    image,
                    partition: entry.name.clone(),
                }
            };

            guarded.push(match guard {
                Some((guard, depth)) => Step::VersionGuard {
                    guard,
                    depth,
                    steps: vec![flash],
                },
                None => flash,
            });
        }

        if !guarded.is_empty() {
            steps.push(Step::MachidGuard {
                machids,
                steps: guarded,
            });
        }
        Ok(())
    }
}

/// The layout's placeholder for "no image".
fn is_none(filename: &str) -> bool {
    filename.eq_ignore_ascii_case("none")
}

#[cfg(test)]
mod fixtures {
    use super::*;
    use crate::xml::Element;

    pub struct Fixture {
        pub dir: tempfile::TempDir,
        pub opts: PackOptions,
        pub config: BoardConfig,
    }

    impl Fixture {
        pub fn new(config: &str) -> anyhow::Result<Self> {
            let dir = tempfile::TempDir::new()?;
            let opts = PackOptions::new("ipq5332", dir.path(), dir.path(), dir.path())?;
            let config = BoardConfig::from_root(Element::parse(config)?)?;
            Ok(Self { dir, opts, config })
        }

        pub fn image(&self, name: &str, size: usize) -> anyhow::Result<()> {
            fs::write(self.dir.path().join(name), vec![0xA5; size])?;
            Ok(())
        }
    }

    pub fn entry(name: &str, offset: u64, length: u64) -> PartitionEntry {
        PartitionEntry {
            name: name.into(),
            offset,
            length,
            device_index: 0,
        }
    }

    pub const EMMC_CONFIG: &str = r#"<config>
        <data type="MACH_ID_BOARD_MAP">
            <entry><machid>0x8060001</machid><board>mi01.2</board></entry>
        </data>
        <data type="EMMC_PARAMETER">
            <total_block>0x1000</total_block>
            <partition_mbn>gpt_main0.bin</partition_mbn>
        </data>
    </config>"#;
}

#[cfg(test)]
use fixtures::*;

#[test]
fn test_emmc_end_to_end() -> anyhow::Result<()> {
    let fx = Fixture::new(EMMC_CONFIG)?;
    fx.image("gpt_main0.bin", 33 * 512)?;
    fx.image("rootfs.bin", 8 * 512)?;

    let layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<emmc><physical_partition ref="emmc">
                <partition label="rootfs" filename="rootfs.bin"/>
            </physical_partition></emmc>"#,
        )?,
        FlashType::Emmc,
        DeviceKind::Emmc,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("0:GPT", 0, 33));
    table.insert(entry("rootfs", 34, 8));

    let mut resolver = VariantResolver::default();
    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let plan = engine.plan(Pass {
        flash_type: FlashType::Emmc,
        device: FlashDeviceInfo::emmc(512, 0x1000),
        table: &table,
        layout: &layout,
        terminate: true,
    })?;

    assert_eq!(plan.flashinit, Some("mmc"));
    assert_eq!(plan.machids, ["8060001"]);
    assert_eq!(
        plan.steps,
        [
            Step::Flash {
                image: ImageRef::new("gpt", "gpt_main0.bin"),
                partition: "0:GPT".into(),
            },
            Step::Flash {
                image: ImageRef::new("rootfs", "rootfs.bin"),
                partition: "rootfs".into(),
            },
        ]
    );
    Ok(())
}

#[test]
fn test_capacity_boundary() -> anyhow::Result<()> {
    let fx = Fixture::new(EMMC_CONFIG)?;
    let layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<nand><partitions>
                <partition><name>0:HLOS</name><img_name>hlos.img</img_name></partition>
            </partitions></nand>"#,
        )?,
        FlashType::Nor,
        DeviceKind::Nor,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("0:HLOS", 0, 0x1000));
    let device = FlashDeviceInfo::new(DeviceKind::Nor, 256, 256, 256);

    let mut resolver = VariantResolver::default();
    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let pass = Pass {
        flash_type: FlashType::Nor,
        device,
        table: &table,
        layout: &layout,
        terminate: true,
    };

    fx.image("hlos.img", 0x1000)?;
    let plan = engine.plan(pass)?;
    assert_eq!(plan.images().len(), 1);
    assert_eq!(plan.flashinit, None);

    fx.image("hlos.img", 0x1001)?;
    let err = engine.plan(pass).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ValidationError>(),
        Some(&ValidationError::Oversize {
            label: "hlos".into(),
            image: "hlos.img".into(),
            size: 0x1001,
            capacity: 0x1000,
        })
    );
    Ok(())
}

#[test]
fn test_missing_partition_policy() -> anyhow::Result<()> {
    let fx = Fixture::new(EMMC_CONFIG)?;
    for name in ["a.img", "b.img", "c.img", "d.img"] {
        fx.image(name, 16)?;
    }
    let layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<nand><partitions>
                <partition><name>0:HLOS</name><img_name>a.img</img_name></partition>
                <partition><name>rootfs</name><img_name>b.img</img_name></partition>
                <partition><name>wifi</name><img_name>c.img</img_name></partition>
                <partition><name>extra</name><img_name>d.img</img_name></partition>
            </partitions></nand>"#,
        )?,
        FlashType::NorPlusNand,
        DeviceKind::Nor,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("0:HLOS", 0, 0x1000));
    let device = FlashDeviceInfo::new(DeviceKind::Nor, 256, 256, 256);

    let mut resolver = VariantResolver::default();
    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let mut pass = Pass {
        flash_type: FlashType::NorPlusNand,
        device,
        table: &table,
        layout: &layout,
        terminate: true,
    };

    // Three NAND-side images without a NOR partition is one too many
    let err = engine.plan(pass).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ValidationError>(),
        Some(&ValidationError::TooManySecondaryImages(3))
    );

    pass.flash_type = FlashType::NorPlusEmmc;
    let plan = engine.plan(pass)?;
    assert_eq!(plan.images().len(), 1);

    pass.flash_type = FlashType::Nor;
    let err = engine.plan(pass).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ValidationError>(),
        Some(&ValidationError::MissingPartition("rootfs".into()))
    );
    Ok(())
}

#[test]
fn test_per_board_slots() -> anyhow::Result<()> {
    let fx = Fixture::new(crate::config::TEST_CONFIG)?;
    fx.image("cdt-mi01.2_256M16.bin", 64)?;
    fx.image("cdt-mi01.3_128M16.bin", 0)?;
    fx.image("bootldr1_mi01.3_128M16.mbn", 128)?;
    fx.image("nand-system-partition-ipq5332.bin", 256)?;

    let layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<nand><partitions>
                <partition><name>0:MIBIB</name><img_name>nand-system-partition-ipq5332.bin</img_name></partition>
                <partition><name>0:CDT</name><img_name>cdt.bin</img_name></partition>
                <partition><name>0:BOOTLDR1</name><img_name>bootldr1.mbn</img_name></partition>
            </partitions></nand>"#,
        )?,
        FlashType::Nand,
        DeviceKind::Nand,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("0:MIBIB", 0, 0x20000));
    table.insert(entry("0:CDT", 0x20000, 0x20000));
    table.insert(entry("0:BOOTLDR1", 0x40000, 0x20000));
    let device = fx.config.flash_device(FlashType::Nand)?;

    let mut resolver = VariantResolver::default();
    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let plan = engine.plan(Pass {
        flash_type: FlashType::Nand,
        device,
        table: &table,
        layout: &layout,
        terminate: true,
    })?;

    assert_eq!(plan.flashinit, Some("nand"));
    let mibib = ImageRef::new("mibib", "nand-system-partition-ipq5332.bin");
    assert_eq!(
        plan.steps,
        [
            Step::MibibReload {
                image: Some(mibib.clone()),
                device,
            },
            Step::Flash {
                image: mibib,
                partition: "0:MIBIB".into(),
            },
            // The empty CDT of the second board is not flashed
            Step::MachidGuard {
                machids: vec!["8060001".into()],
                steps: vec![Step::Flash {
                    image: ImageRef::new("ddr-mi01.2_256M16", "cdt-mi01.2_256M16.bin"),
                    partition: "0:CDT".into(),
                }],
            },
            Step::MachidGuard {
                machids: vec!["8060002".into()],
                steps: vec![Step::Flash {
                    image: ImageRef::new("bootldr1_mi01.3_128M16", "bootldr1_mi01.3_128M16.mbn"),
                    partition: "0:BOOTLDR1".into(),
                }],
            },
        ]
    );
    Ok(())
}

#[test]
fn test_wifi_firmware() -> anyhow::Result<()> {
    let fx = Fixture::new(crate::config::TEST_CONFIG)?;
    fx.image("ipq5332_qcn9224_wifi_fw-squashfs.img", 4096)?;
    fx.image("generic_wifi_fw-squashfs.img", 4096)?;
    fx.image("root.ubi", 4096)?;
    // Empty partition tables are resolved but never flashed
    fx.image("gpt_main0.bin", 0)?;
    fx.image("gpt_backup0.bin", 0)?;

    let emmc_layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<emmc><physical_partition ref="emmc">
                <partition label="0:WIFIFW" filename="generic_wifi_fw-squashfs.img"/>
            </physical_partition></emmc>"#,
        )?,
        FlashType::Emmc,
        DeviceKind::Emmc,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("0:GPT", 0, 34));
    table.insert(entry("0:WIFIFW", 0x100, 16));
    table.insert(entry("0:GPTBACKUP", 0x200, 33));

    let mut resolver = VariantResolver::default();
    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let plan = engine.plan(Pass {
        flash_type: FlashType::Emmc,
        device: fx.config.emmc_device(FlashType::Emmc)?,
        table: &table,
        layout: &emmc_layout,
        terminate: true,
    })?;

    // Boards without a firmware family get the row's image, the others their own family
    assert_eq!(
        plan.steps,
        [
            Step::MachidGuard {
                machids: vec!["8060002".into()],
                steps: vec![Step::Flash {
                    image: ImageRef::new("generic_wifi_fw", "generic_wifi_fw-squashfs.img"),
                    partition: "0:WIFIFW".into(),
                }],
            },
            Step::MachidGuard {
                machids: vec!["8060001".into()],
                steps: vec![Step::Flash {
                    image: ImageRef::new(
                        "ipq5332_qcn9224_wifi_fw",
                        "ipq5332_qcn9224_wifi_fw-squashfs.img"
                    ),
                    partition: "0:WIFIFW".into(),
                }],
            },
        ]
    );

    // On NAND the firmware follows rootfs into its UBI volume
    let nand_layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<nand><partitions>
                <partition><name>rootfs</name><img_name>root.ubi</img_name></partition>
            </partitions></nand>"#,
        )?,
        FlashType::Nand,
        DeviceKind::Nand,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("rootfs", 0, 0x100_0000));
    let plan = engine.plan(Pass {
        flash_type: FlashType::Nand,
        device: fx.config.flash_device(FlashType::Nand)?,
        table: &table,
        layout: &nand_layout,
        terminate: true,
    })?;
    let images: Vec<_> = plan
        .images()
        .into_iter()
        .map(|(i, p)| (i.label.as_str(), p))
        .collect();
    assert_eq!(
        images,
        [("ubi", Some("rootfs")), ("ipq5332_qcn9224_wifi_fw", Some("wifi_fw"))]
    );
    Ok(())
}

#[test]
fn test_missing_wifi_firmware() -> anyhow::Result<()> {
    let fx = Fixture::new(crate::config::TEST_CONFIG)?;
    fx.image("root.ubi", 4096)?;
    let layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<nand><partitions>
                <partition><name>rootfs</name><img_name>root.ubi</img_name></partition>
            </partitions></nand>"#,
        )?,
        FlashType::Nand,
        DeviceKind::Nand,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("rootfs", 0, 0x100_0000));

    let mut resolver = VariantResolver::default();
    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let err = engine
        .plan(Pass {
            flash_type: FlashType::Nand,
            device: fx.config.flash_device(FlashType::Nand)?,
            table: &table,
            layout: &layout,
            terminate: true,
        })
        .unwrap_err();
    assert_eq!(
        err.downcast_ref::<ValidationError>(),
        Some(&ValidationError::MissingWifiFirmware(
            "ipq5332_qcn9224_wifi_fw-squashfs.img".into()
        ))
    );
    Ok(())
}

/// SoC and radio firmware axes, both at major version 1.
#[cfg(test)]
fn two_axes() -> Vec<crate::variant::VersionAxis> {
    use crate::variant::VersionAxis;

    vec![
        VersionAxis::new("ipq5332", 1, "ipq5332"),
        VersionAxis::new("qcn9224", 1, "ipq5332"),
    ]
}

#[test]
fn test_versioned_wifi_in_ubi() -> anyhow::Result<()> {
    use crate::manifest::ImageManifest;
    use crate::script::FlashScript;

    let fx = Fixture::new(crate::config::TEST_CONFIG)?;
    fx.image("root.ubi", 4096)?;
    fx.image("ipq5332_qcn9224_wifi_fw-squashfs.img", 4096)?;
    fx.image("ipq5332_v2_qcn9224_v2_wifi_fw-squashfs.img", 4096)?;

    let layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<nand><partitions>
                <partition><name>rootfs</name><img_name>root.ubi</img_name></partition>
            </partitions></nand>"#,
        )?,
        FlashType::Nand,
        DeviceKind::Nand,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("rootfs", 0, 0x100_0000));

    let axes = two_axes();
    let v1 = format!("{}{}", axes[0].default_guard, axes[1].default_guard);
    let v2 = format!("{}{}", axes[0].next_guard, axes[1].next_guard);
    let mut resolver = VariantResolver::new(axes);

    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let mut plan = engine.plan(Pass {
        flash_type: FlashType::Nand,
        device: fx.config.flash_device(FlashType::Nand)?,
        table: &table,
        layout: &layout,
        terminate: true,
    })?;

    let wifi = |filename: &str| Step::Flash {
        image: ImageRef::new(wifi_label(filename), filename),
        partition: "wifi_fw".into(),
    };
    assert_eq!(
        plan.steps,
        [
            Step::Flash {
                image: ImageRef::new("ubi", "root.ubi"),
                partition: "rootfs".into(),
            },
            Step::DetectVersions,
            Step::MachidGuard {
                machids: vec!["8060001".into()],
                steps: vec![
                    Step::VersionGuard {
                        guard: v1.clone(),
                        depth: 2,
                        steps: vec![wifi("ipq5332_qcn9224_wifi_fw-squashfs.img")],
                    },
                    Step::VersionGuard {
                        guard: v2.clone(),
                        depth: 2,
                        steps: vec![wifi("ipq5332_v2_qcn9224_v2_wifi_fw-squashfs.img")],
                    },
                ],
            },
        ]
    );

    let mut manifest = ImageManifest::new();
    manifest.add_plan(&plan);
    let labels: Vec<_> = manifest.iter().map(|i| i.label.clone()).collect();
    assert_eq!(
        labels,
        [
            "script".to_owned(),
            format!("ubi-{}", sha1_hex("root.ubi")),
            format!(
                "ipq5332_qcn9224_wifi_fw-{}",
                sha1_hex("ipq5332_qcn9224_wifi_fw-squashfs.img")
            ),
            format!(
                "ipq5332_v2_qcn9224_v2_wifi_fw-{}",
                sha1_hex("ipq5332_v2_qcn9224_v2_wifi_fw-squashfs.img")
            ),
        ]
    );

    // The prologue guards have their own coverage
    plan.soc_versions.clear();
    plan.machids.clear();
    let mut script = FlashScript::new();
    emit(&plan, &mut script);
    assert_eq!(
        script.dumps(),
        format!(
            "flashinit nand || exit 1\n\
             xtract_n_flash $imgaddr {} rootfs || exit 1\n\
             qcn_detect\n\
             if test \"$machid\" = \"8060001\"; then\n\n\
             {v1}\n\
             xtract_n_flash $imgaddr {} wifi_fw || exit 1\n\
             fi\n\nfi\n\n\
             {v2}\n\
             xtract_n_flash $imgaddr {} wifi_fw || exit 1\n\
             fi\n\nfi\n\n\
             fi\n\n\
             exit 0\n\n",
            labels[1], labels[2], labels[3],
        )
    );
    Ok(())
}

#[test]
fn test_versioned_wifi_partition() -> anyhow::Result<()> {
    let fx = Fixture::new(crate::config::TEST_CONFIG)?;
    fx.image("generic_wifi_fw-squashfs.img", 4096)?;
    fx.image("gpt_main0.bin", 0)?;
    fx.image("gpt_backup0.bin", 0)?;

    let layout = PartitionLayout::from_root(
        &crate::xml::Element::parse(
            r#"<emmc><physical_partition ref="emmc">
                <partition label="0:WIFIFW" filename="generic_wifi_fw-squashfs.img"/>
            </physical_partition></emmc>"#,
        )?,
        FlashType::Emmc,
        DeviceKind::Emmc,
    );
    let mut table = PartitionTable::new();
    table.insert(entry("0:GPT", 0, 34));
    table.insert(entry("0:WIFIFW", 0x100, 16));
    table.insert(entry("0:GPTBACKUP", 0x200, 33));

    let axes = two_axes();
    let guard = format!("{}{}", axes[0].default_guard, axes[1].default_guard);
    let mut resolver = VariantResolver::new(axes);

    let mut engine = PartitionResolutionEngine::new(&fx.opts, &fx.config, &mut resolver);
    let plan = engine.plan(Pass {
        flash_type: FlashType::Emmc,
        device: fx.config.emmc_device(FlashType::Emmc)?,
        table: &table,
        layout: &layout,
        terminate: true,
    })?;

    // The unversioned name resolves to itself once. No variant of the board family's firmware
    // is on disk, so that family contributes nothing and is not an error.
    assert_eq!(
        plan.steps,
        [
            Step::DetectVersions,
            Step::MachidGuard {
                machids: vec!["8060002".into()],
                steps: vec![Step::VersionGuard {
                    guard,
                    depth: 2,
                    steps: vec![Step::Flash {
                        image: ImageRef::new("generic_wifi_fw", "generic_wifi_fw-squashfs.img"),
                        partition: "0:WIFIFW".into(),
                    }],
                }],
            },
        ]
    );
    Ok(())
}
