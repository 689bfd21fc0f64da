//! The external tools that build the UBI rootfs and the final blob: `ubinize` and `mkimage`,
//! both shipped in the source directory.

use anyhow::{bail, Context};

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::PackOptions;
use crate::flash::FlashType;
use crate::util::ReadExt;

/// Run a command to completion, failing unless it exits successfully.
pub fn run(cmd: &mut Command, what: &str) -> anyhow::Result<()> {
    log::debug!("running {cmd:?}");
    let status = cmd
        .status()
        .with_context(|| format!("error executing {what}"))?;
    if !status.success() {
        bail!("{what} failed ({status})");
    }
    Ok(())
}

/// UBI geometry parameters for `ubinize`, by NAND page size.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UbiGeometry {
    pub min_io_size: u32,
    pub peb_size: &'static str,
}

impl UbiGeometry {
    pub fn for_flash(flash_type: FlashType) -> Self {
        if flash_type.is_4k() {
            Self {
                min_io_size: 4096,
                peb_size: "256KiB",
            }
        } else {
            Self {
                min_io_size: 2048,
                peb_size: "128KiB",
            }
        }
    }

    /// Block size the UBI image is padded to when copied into place.
    pub fn pad_block(&self) -> usize {
        self.min_io_size as usize
    }
}

/// Write `tmp-<arch>-ubinize[_64].cfg` next to the original, with every `image=` path made
/// relative to the source directory.
pub fn rewrite_ubinize_cfg(opts: &PackOptions) -> anyhow::Result<PathBuf> {
    let name = format!("{}-ubinize{}.cfg", opts.arch, opts.mode.suffix());
    let src = opts.layout_dir().join(&name);
    let dst = opts.layout_dir().join(format!("tmp-{name}"));

    let cfg =
        fs::read_to_string(&src).with_context(|| format!("error opening {}", src.display()))?;
    let prefix = format!("image={}/", opts.src_dir.display());
    fs::write(&dst, cfg.replace("image=", &prefix))
        .with_context(|| format!("error writing {}", dst.display()))?;

    Ok(dst)
}

/// Build the rootfs UBI image described by `cfg`, returning its path.
pub fn ubinize(opts: &PackOptions, flash_type: FlashType, cfg: &Path) -> anyhow::Result<PathBuf> {
    let geometry = UbiGeometry::for_flash(flash_type);
    let output = opts.layout_dir().join("tmp-root.ubi");

    run(
        Command::new(opts.src_dir.join("ubinize"))
            .arg("-m")
            .arg(geometry.min_io_size.to_string())
            .arg("-p")
            .arg(geometry.peb_size)
            .arg("-o")
            .arg(&output)
            .arg(cfg),
        "ubinize",
    )
    .context("ubinization got failed")?;

    Ok(output)
}

/// Copy `src` to `dst`, zero-padding the final partial block to `block` bytes.
pub fn pad_copy(src: &Path, dst: &Path, block: usize) -> anyhow::Result<u64> {
    let mut input = File::open(src).with_context(|| format!("error opening {}", src.display()))?;
    let mut output =
        File::create(dst).with_context(|| format!("error creating {}", dst.display()))?;

    let mut written = 0u64;
    let mut buf = Vec::with_capacity(block);
    loop {
        buf.clear();
        input.read_to_vec(&mut buf, block)?;
        if buf.is_empty() {
            break;
        }
        buf.resize(block, 0);
        output.write_all(&buf)?;
        written += block as u64;
    }

    output.flush()?;
    Ok(written)
}

/// Build the rootfs UBI image for a NAND-family flash type and copy it over the image the
/// layout's `rootfs` row names.
pub fn build_rootfs(opts: &PackOptions, flash_type: FlashType, rootfs_image: &str) -> anyhow::Result<()> {
    let cfg = rewrite_ubinize_cfg(opts)?;
    let ubi = ubinize(opts, flash_type, &cfg)?;

    let geometry = UbiGeometry::for_flash(flash_type);
    let target = opts.src_dir.join(rootfs_image);
    let size = pad_copy(&ubi, &target, geometry.pad_block())
        .context("ubi image copy operation failed")?;
    log::info!("UBI image {} ({size} bytes)", target.display());
    Ok(())
}

/// Assemble the blob described by `its` into `output`.
pub fn mkimage(opts: &PackOptions, its: &Path, output: &Path) -> anyhow::Result<()> {
    run(
        Command::new(opts.src_dir.join("mkimage"))
            .arg("-f")
            .arg(its)
            .arg(output),
        "mkimage",
    )
    .context("failed to create u-boot image from script")
}

#[test]
fn test_ubi_geometry() {
    assert_eq!(UbiGeometry::for_flash(FlashType::Nand).min_io_size, 2048);
    assert_eq!(UbiGeometry::for_flash(FlashType::NorPlusNand).peb_size, "128KiB");
    assert_eq!(UbiGeometry::for_flash(FlashType::Nand4k).peb_size, "256KiB");
    assert_eq!(UbiGeometry::for_flash(FlashType::NorPlusNand4k).pad_block(), 4096);
}

#[test]
fn test_rewrite_ubinize_cfg() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let opts = PackOptions::new("ipq5332_64", dir.path(), dir.path(), dir.path())?;
    fs::create_dir_all(opts.layout_dir())?;
    fs::write(
        opts.layout_dir().join("ipq5332-ubinize_64.cfg"),
        "[ubifs]\nmode=ubi\nimage=ubi-root.img\nvol_id=0\n",
    )?;

    let tmp = rewrite_ubinize_cfg(&opts)?;
    assert_eq!(tmp, opts.layout_dir().join("tmp-ipq5332-ubinize_64.cfg"));
    assert_eq!(
        fs::read_to_string(tmp)?,
        format!(
            "[ubifs]\nmode=ubi\nimage={}/ubi-root.img\nvol_id=0\n",
            dir.path().display()
        )
    );
    Ok(())
}

#[test]
fn test_pad_copy() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let src = dir.path().join("root.ubi");
    let dst = dir.path().join("padded.ubi");

    fs::write(&src, vec![0xFF; 5000])?;
    assert_eq!(pad_copy(&src, &dst, 2048)?, 6144);
    let padded = fs::read(&dst)?;
    assert_eq!(padded.len(), 6144);
    assert!(padded[..5000].iter().all(|&b| b == 0xFF));
    assert!(padded[5000..].iter().all(|&b| b == 0));

    fs::write(&src, b"")?;
    assert_eq!(pad_copy(&src, &dst, 2048)?, 0);
    assert!(fs::read(&dst)?.is_empty());
    Ok(())
}

#[test]
fn test_run_missing_tool() -> anyhow::Result<()> {
    let dir = tempfile::TempDir::new()?;
    let err = run(&mut Command::new(dir.path().join("mkimage")), "mkimage").unwrap_err();
    assert!(err.to_string().contains("error executing mkimage"));
    Ok(())
}
