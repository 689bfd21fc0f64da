//! Packing one output image per flash type.
//!
//! For every flash type the packer decodes the partition table, resolves the layout against it,
//! writes `flash.scr` and `flash.its` into the images directory and hands the result to `mkimage`.
//! NOR+eMMC runs two passes (NOR, then eMMC) into the same script.

use anyhow::Context;

use std::fs;
use std::path::PathBuf;

use crate::config::{BoardConfig, PackOptions};
use crate::engine::{emit, Pass, PartitionResolutionEngine};
use crate::flash::{DeviceKind, FlashDeviceInfo, FlashType};
use crate::its;
use crate::layout::PartitionLayout;
use crate::manifest::{ImageManifest, SCRIPT_FILENAME};
use crate::script::FlashScript;
use crate::table::PartitionTable;
use crate::tools;
use crate::variant::VariantResolver;

/// Everything generated for one flash type, before `mkimage` runs.
#[derive(Debug, Clone)]
pub struct PackOutput {
    pub script: FlashScript,
    pub manifest: ImageManifest,
    /// The device of the last pass, which the blob is described against
    pub device: FlashDeviceInfo,
}

/// A partition table and the layout to resolve against it.
struct PassInput {
    device: FlashDeviceInfo,
    table: PartitionTable,
    layout: PartitionLayout,
}

pub struct Packer {
    opts: PackOptions,
    config: BoardConfig,
    resolver: VariantResolver,
}

impl Packer {
    /// Load the board configuration for `opts`.
    pub fn new(opts: PackOptions) -> anyhow::Result<Self> {
        let path = opts.config_path();
        let config = BoardConfig::load(&path)
            .with_context(|| format!("error loading board configuration {}", path.display()))?;
        Self::with_config(opts, config)
    }

    pub fn with_config(opts: PackOptions, config: BoardConfig) -> anyhow::Result<Self> {
        let axes = config.version_axes(&opts.arch)?;
        if !axes.is_empty() {
            log::info!("Wi-Fi firmware version checks enabled ({} axes)", axes.len());
        }

        Ok(Self {
            opts,
            config,
            resolver: VariantResolver::new(axes),
        })
    }

    pub fn options(&self) -> &PackOptions {
        &self.opts
    }

    /// The requested flash types, plus the 4 KiB page companions of the NAND types when the
    /// board describes both page sizes.
    pub fn flash_types(&self) -> Vec<FlashType> {
        let mut types = self.opts.flash_types.clone();
        if self.opts.skip_4k_nand || !self.config.has_nand_page_variants() {
            return types;
        }

        for companion in self.opts.flash_types.iter().filter_map(|t| t.companion_4k()) {
            if !types.contains(&companion) {
                types.push(companion);
            }
        }
        types
    }

    /// Decode the MIBIB of a NAND/NOR pass.
    fn flash_pass(&self, flash_type: FlashType) -> anyhow::Result<PassInput> {
        let device = self.config.flash_device(flash_type)?;
        let layout = PartitionLayout::load(&self.opts, flash_type, device.kind)?;
        let table_image = layout
            .table_image()
            .ok_or(anyhow::anyhow!("{flash_type} layout names no partition table image"))?;
        let secondary = self.config.secondary_device(flash_type, &device)?;
        let table = PartitionTable::load(self.opts.image_path(table_image), &device, &secondary)?;

        Ok(PassInput {
            device,
            table,
            layout,
        })
    }

    /// Decode the GPT of an eMMC pass.
    fn emmc_pass(&self, flash_type: FlashType) -> anyhow::Result<PassInput> {
        let device = self.config.emmc_device(flash_type)?;
        let layout = PartitionLayout::load(&self.opts, flash_type, DeviceKind::Emmc)?;
        let table_image = self.config.partition_mbn(flash_type)?;
        let table = PartitionTable::load(self.opts.image_path(&table_image), &device, &device)?;

        Ok(PassInput {
            device,
            table,
            layout,
        })
    }

    fn passes(&self, flash_type: FlashType) -> anyhow::Result<Vec<PassInput>> {
        Ok(match flash_type {
            FlashType::Emmc => vec![self.emmc_pass(flash_type)?],
            FlashType::NorPlusEmmc => vec![
                self.flash_pass(flash_type)?,
                self.emmc_pass(flash_type)?,
            ],
            _ => vec![self.flash_pass(flash_type)?],
        })
    }

    /// Build the flashing script and the image list for one flash type.
    pub fn generate(&mut self, flash_type: FlashType) -> anyhow::Result<PackOutput> {
        let inputs = self.passes(flash_type)?;

        let mut script = FlashScript::new();
        let mut manifest = ImageManifest::new();
        let mut engine = PartitionResolutionEngine::new(&self.opts, &self.config, &mut self.resolver);
        let mut device = None;

        let count = inputs.len();
        for (i, input) in inputs.iter().enumerate() {
            log::debug!("{flash_type}: {} pass", input.device.kind);
            let plan = engine.plan(Pass {
                flash_type,
                device: input.device,
                table: &input.table,
                layout: &input.layout,
                terminate: i + 1 == count,
            })?;

            emit(&plan, &mut script);
            manifest.add_plan(&plan);
            device = Some(input.device);
        }

        let device = device.ok_or(anyhow::anyhow!("no passes for {flash_type}"))?;
        Ok(PackOutput {
            script,
            manifest,
            device,
        })
    }

    /// Rebuild the UBI rootfs the layout of a NAND-family flash type flashes.
    fn prepare_rootfs(&self, flash_type: FlashType) -> anyhow::Result<()> {
        let layout = PartitionLayout::load(&self.opts, flash_type, flash_type.device_kind())?;
        match layout.rootfs_image(self.opts.mode) {
            Some(image) => tools::build_rootfs(&self.opts, flash_type, image),
            None => {
                log::warn!("{flash_type} layout has no rootfs partition, not building UBI image");
                Ok(())
            }
        }
    }

    /// Produce the output image for one flash type, returning its path.
    pub fn pack(&mut self, flash_type: FlashType) -> anyhow::Result<PathBuf> {
        let output = self.opts.output_path(flash_type);

        if flash_type.is_nand_family() {
            self.prepare_rootfs(flash_type)?;
        }

        let generated = self.generate(flash_type)?;

        let script_path = self.opts.image_path(SCRIPT_FILENAME);
        fs::write(&script_path, generated.script.dumps())
            .with_context(|| format!("error writing to script '{}'", script_path.display()))?;

        let its_path = self.opts.image_path("flash.its");
        fs::write(&its_path, its::render(&generated.manifest, &generated.device))
            .with_context(|| format!("error opening its file '{}'", its_path.display()))?;

        log::info!(
            "{flash_type}: {} images into {}",
            generated.manifest.len(),
            output.display()
        );
        tools::mkimage(&self.opts, &its_path, &output)?;

        Ok(output)
    }
}

#[cfg(test)]
fn test_tree(layouts: &[(&str, &str)]) -> anyhow::Result<(tempfile::TempDir, PackOptions)> {
    let dir = tempfile::TempDir::new()?;
    let src = dir.path().join("src");
    let images = dir.path().join("images");
    let opts = PackOptions::new("ipq5332", &src, &images, dir.path().join("out"))?;

    fs::create_dir_all(opts.layout_dir())?;
    fs::create_dir_all(&images)?;
    fs::write(opts.config_path(), crate::config::TEST_CONFIG)?;
    for (name, content) in layouts {
        fs::write(opts.layout_dir().join(name), content)?;
    }

    Ok((dir, opts))
}

#[test]
fn test_flash_types() -> anyhow::Result<()> {
    let (_dir, mut opts) = test_tree(&[])?;
    opts.flash_types = crate::config::parse_flash_types("nand,norplusnand,emmc")?;

    let packer = Packer::new(opts.clone())?;
    assert_eq!(
        packer.flash_types(),
        [
            FlashType::Nand,
            FlashType::NorPlusNand,
            FlashType::Emmc,
            FlashType::Nand4k,
            FlashType::NorPlusNand4k
        ]
    );

    opts.skip_4k_nand = true;
    let packer = Packer::new(opts)?;
    assert_eq!(packer.flash_types().len(), 3);
    Ok(())
}

#[test]
fn test_generate_emmc() -> anyhow::Result<()> {
    use crate::util::sha1_hex;

    let (_dir, opts) = test_tree(&[(
        "emmc-partition.xml",
        r#"<emmc><physical_partition ref="emmc">
            <partition label="0:HLOS" filename="kernel.img"/>
            <partition label="rootfs" filename="rootfs.img" image_type="hlos"/>
        </physical_partition></emmc>"#,
    )])?;

    let gpt = crate::table::gpt::build_gpt(1, 34, 0xFFFF, &[("0:HLOS", 34, 41), ("rootfs", 42, 49)]);
    fs::write(opts.image_path("gpt_main0.bin"), gpt)?;
    fs::write(opts.image_path("gpt_backup0.bin"), [0u8; 512])?;
    fs::write(opts.image_path("kernel.img"), [0u8; 4096])?;
    fs::write(opts.image_path("rootfs.img"), [0u8; 4096])?;

    let mut packer = Packer::new(opts)?;
    let output = packer.generate(FlashType::Emmc)?;
    assert_eq!(output.device.kind, DeviceKind::Emmc);

    let script = output.script.dumps();
    assert!(script.contains("flashinit mmc || exit 1\n"));
    assert!(script.contains(&format!(
        "xtract_n_flash $imgaddr gpt-{} 0:GPT || exit 1\n",
        sha1_hex("gpt_main0.bin")
    )));
    assert!(script.contains(&format!(
        "xtract_n_flash $imgaddr hlos-{} 0:HLOS || exit 1\n",
        sha1_hex("kernel.img")
    )));
    assert!(script.ends_with(&format!(
        "xtract_n_flash $imgaddr gptbackup-{} 0:GPTBACKUP || exit 1\nexit 0\n\n",
        sha1_hex("gpt_backup0.bin")
    )));

    let labels: Vec<_> = output.manifest.iter().map(|i| i.filename.as_str()).collect();
    assert_eq!(
        labels,
        ["flash.scr", "gpt_main0.bin", "kernel.img", "rootfs.img", "gpt_backup0.bin"]
    );
    Ok(())
}

#[test]
fn test_generate_nor() -> anyhow::Result<()> {
    let (_dir, opts) = test_tree(&[(
        "nor-partition.xml",
        r#"<nor><partitions>
            <partition><name>0:SBL1</name><img_name>sbl1_nor.mbn</img_name></partition>
            <partition><name>0:MIBIB</name><img_name>nor-system-partition-ipq5332.bin</img_name></partition>
            <partition><name>0:HLOS</name><img_name>kernel.img</img_name></partition>
        </partitions></nor>"#,
    )])?;

    let mibib = crate::table::mibib::build_mibib(
        256,
        &[(b"0:SBL1", 0, 1, 0), (b"0:MIBIB", 1, 1, 0), (b"0:HLOS", 2, 4, 0)],
    );
    fs::write(opts.image_path("nor-system-partition-ipq5332.bin"), mibib)?;
    fs::write(opts.image_path("sbl1_nor.mbn"), [0u8; 1024])?;
    fs::write(opts.image_path("kernel.img"), [0u8; 4096])?;

    let mut packer = Packer::new(opts)?;
    let output = packer.generate(FlashType::Nor)?;

    let script = output.script.dumps();
    assert!(script.contains("if test \"$machid\" = \"8060001\" || test \"$machid\" = \"8060002\" ; then\n"));
    assert!(!script.contains("flashinit"));
    assert!(script.contains("mibib_reload 1 100 10000 1000000 || exit 1\n"));
    assert!(script.ends_with("exit 0\n\n"));

    let images: Vec<_> = output
        .manifest
        .iter()
        .map(|i| (i.filename.as_str(), i.target_partition.as_deref()))
        .collect();
    assert_eq!(
        images,
        [
            ("flash.scr", None),
            ("nor-system-partition-ipq5332.bin", Some("0:MIBIB")),
            ("sbl1_nor.mbn", Some("0:SBL1")),
            ("kernel.img", Some("0:HLOS")),
        ]
    );
    Ok(())
}

#[test]
fn test_missing_partition_aborts() -> anyhow::Result<()> {
    let (_dir, opts) = test_tree(&[(
        "nor-partition.xml",
        r#"<nor><partitions>
            <partition><name>0:MIBIB</name><img_name>nor-system-partition-ipq5332.bin</img_name></partition>
            <partition><name>0:ART</name><img_name>art.bin</img_name></partition>
        </partitions></nor>"#,
    )])?;

    let mibib = crate::table::mibib::build_mibib(256, &[(b"0:MIBIB", 1, 1, 0)]);
    fs::write(opts.image_path("nor-system-partition-ipq5332.bin"), mibib)?;
    fs::write(opts.image_path("art.bin"), [0u8; 16])?;

    let mut packer = Packer::new(opts)?;
    let err = packer.generate(FlashType::Nor).unwrap_err();
    assert_eq!(
        err.downcast_ref::<crate::error::ValidationError>(),
        Some(&crate::error::ValidationError::MissingPartition("0:ART".into()))
    );
    Ok(())
}

#[test]
fn test_generate_nor_plus_emmc() -> anyhow::Result<()> {
    use crate::util::sha1_hex;

    let (_dir, opts) = test_tree(&[
        (
            "norplusemmc-partition.xml",
            r#"<nor><partitions>
                <partition><name>0:SBL1</name><img_name>sbl1_nor.mbn</img_name></partition>
                <partition><name>0:MIBIB</name><img_name>nor-system-partition-ipq5332.bin</img_name></partition>
                <partition><name>0:HLOS</name><img_name>kernel.img</img_name></partition>
                <partition><name>rootfs</name><img_name>rootfs.img</img_name></partition>
            </partitions></nor>"#,
        ),
        (
            "emmc-partition.xml",
            r#"<emmc><physical_partition ref="norplusemmc">
                <partition label="0:HLOS" filename="kernel.img"/>
                <partition label="rootfs" filename="rootfs.img"/>
            </physical_partition></emmc>"#,
        ),
    ])?;

    let mibib = crate::table::mibib::build_mibib(
        256,
        &[(b"0:SBL1", 0, 1, 0), (b"0:MIBIB", 1, 1, 0), (b"0:HLOS", 2, 4, 0)],
    );
    fs::write(opts.image_path("nor-system-partition-ipq5332.bin"), mibib)?;
    let gpt = crate::table::gpt::build_gpt(1, 34, 0xFFFF, &[("0:HLOS", 34, 41), ("rootfs", 42, 49)]);
    fs::write(opts.image_path("gpt_main1.bin"), gpt)?;
    fs::write(opts.image_path("gpt_backup1.bin"), [0u8; 512])?;
    fs::write(opts.image_path("sbl1_nor.mbn"), [0u8; 1024])?;
    fs::write(opts.image_path("kernel.img"), [0u8; 4096])?;
    fs::write(opts.image_path("rootfs.img"), [0u8; 4096])?;

    let mut packer = Packer::new(opts)?;
    let output = packer.generate(FlashType::NorPlusEmmc)?;
    assert_eq!(output.device.kind, DeviceKind::Emmc);

    let script = output.script.dumps();
    assert_eq!(script.matches("exit 0\n").count(), 1);
    assert_eq!(script.matches("flashinit mmc || exit 1\n").count(), 2);

    // The kernel goes to both flashes but is packed once
    let hlos = format!("xtract_n_flash $imgaddr hlos-{} 0:HLOS || exit 1\n", sha1_hex("kernel.img"));
    assert_eq!(script.matches(&hlos).count(), 2);

    // The partition tables of the eMMC are only written by the eMMC pass
    let reload = script.find("mibib_reload 1 100 10000 1000000 || exit 1\n");
    let gpt = script.find(&format!(
        "xtract_n_flash $imgaddr gpt-{} 0:GPT || exit 1\n",
        sha1_hex("gpt_main1.bin")
    ));
    assert!(reload.is_some() && gpt.is_some());
    assert!(reload < gpt);
    assert!(script.ends_with(&format!(
        "xtract_n_flash $imgaddr gptbackup-{} 0:GPTBACKUP || exit 1\nexit 0\n\n",
        sha1_hex("gpt_backup1.bin")
    )));

    let images: Vec<_> = output
        .manifest
        .iter()
        .map(|i| (i.filename.as_str(), i.target_partition.as_deref()))
        .collect();
    assert_eq!(
        images,
        [
            ("flash.scr", None),
            ("nor-system-partition-ipq5332.bin", Some("0:MIBIB")),
            ("sbl1_nor.mbn", Some("0:SBL1")),
            ("kernel.img", Some("0:HLOS")),
            ("gpt_main1.bin", Some("0:GPT")),
            ("rootfs.img", Some("rootfs")),
            ("gpt_backup1.bin", Some("0:GPTBACKUP")),
        ]
    );
    Ok(())
}
