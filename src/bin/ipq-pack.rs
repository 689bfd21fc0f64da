//! Build single images for every requested flash type.

use anyhow::Context;
use clap::Parser;

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use ipq_pack::config::{parse_flash_types, PackOptions, DEFAULT_FLASH_TYPES};
use ipq_pack::pack::Packer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// SoC to pack for; a `_64` suffix selects the 64-bit images
    #[clap(long)]
    arch: String,

    /// Comma-separated flash types
    #[clap(long, default_value = DEFAULT_FLASH_TYPES)]
    fltype: String,

    /// Directory holding `<arch>/config.xml`, the partition layouts and the packing tools
    #[clap(long, alias = "srcPath")]
    src_path: PathBuf,

    /// Directory holding the images to pack
    #[clap(long, alias = "inImage")]
    in_image: PathBuf,

    /// Directory the single images are written to
    #[clap(long, alias = "outImage")]
    out_image: PathBuf,

    /// Only pack partitions of this image type
    #[clap(long, default_value = "all")]
    image_type: String,

    /// Low-memory profile selecting alternative images
    #[clap(long)]
    memory: Option<String>,

    /// Pack ATF instead of TZ
    #[clap(long)]
    atf: bool,

    /// Don't add the 4 KiB page NAND variants
    #[clap(long, alias = "skip_4k_nand")]
    skip_4k_nand: bool,

    /// More output (repeat for even more)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn options(&self) -> anyhow::Result<PackOptions> {
        let mut opts = PackOptions::new(
            &self.arch,
            &self.src_path,
            &self.in_image,
            &self.out_image,
        )?;
        opts.flash_types = parse_flash_types(&self.fltype)?;
        opts.image_type = self.image_type.clone();
        opts.memory = self.memory.clone().filter(|m| m != "default");
        opts.atf = self.atf;
        opts.skip_4k_nand = self.skip_4k_nand;
        Ok(opts)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let opts = args.options()?;
    fs::create_dir_all(&opts.out_dir)
        .with_context(|| format!("error creating {}", opts.out_dir.display()))?;

    let mut packer = Packer::new(opts)?;
    let flash_types = packer.flash_types();

    howudoin::init(howudoin::consumers::TermLine::default());
    let rpt = howudoin::new()
        .label("Packing")
        .set_len(u64::try_from(flash_types.len()).ok());

    let mut result = Ok(());
    for flash_type in flash_types {
        rpt.desc(flash_type.to_string());
        let output = packer.options().output_path(flash_type);
        let file = output
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        match packer
            .pack(flash_type)
            .with_context(|| format!("Failed to pack {file}"))
        {
            Ok(path) => log::info!("Wrote {}", path.display()),
            Err(e) => {
                result = Err(e);
                break;
            }
        }
        rpt.inc();
    }

    rpt.finish();
    howudoin::disable();
    thread::sleep(Duration::from_millis(10));

    result
}
