// Copyright © 2026 The Cloud Hypervisor Authors
//
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use std::process;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use vhd::config::parse_size;
use vhd::{CreateOptions, DiskType, ImageConfig, ParentInfo, Vhd, DEFAULT_BLOCK_SIZE};

#[derive(Debug, Parser)]
#[command(name = "vhd-img", version, about = "Create and maintain VHD disk images")]
struct Cli {
    /// Increase logging verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new image
    Create(CreateArgs),
    /// Print image metadata as JSON
    Info(ImageArgs),
    /// Free redundant blocks and pack the remaining ones
    Compact(CompactArgs),
    /// Grow the virtual disk
    Resize(ResizeArgs),
    /// Check the image structures and fix what can be fixed
    Repair(RepairArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ImageType {
    Fixed,
    Dynamic,
    Differencing,
}

impl From<ImageType> for DiskType {
    fn from(t: ImageType) -> Self {
        match t {
            ImageType::Fixed => DiskType::Fixed,
            ImageType::Dynamic => DiskType::Dynamic,
            ImageType::Differencing => DiskType::Differencing,
        }
    }
}

#[derive(Debug, Args)]
struct CreateArgs {
    path: PathBuf,
    /// Virtual disk size, accepts K/M/G/T suffixes
    #[arg(long, short, value_parser = parse_size_arg)]
    size: Option<u64>,
    #[arg(long = "type", short = 't', value_enum, default_value_t = ImageType::Dynamic)]
    image_type: ImageType,
    /// Block size of sparse images
    #[arg(long, value_parser = parse_size_arg)]
    block_size: Option<u64>,
    /// Parent image of a differencing image
    #[arg(long, short)]
    parent: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ImageArgs {
    path: PathBuf,
    /// Open options "readonly=on,bitmap_cache_size=<n>,allocation=always|full_block"
    #[arg(long, short, default_value = "")]
    options: String,
}

#[derive(Debug, Args)]
struct CompactArgs {
    path: PathBuf,
    /// Parent image to compare a differencing image against
    #[arg(long, short)]
    parent: Option<PathBuf>,
    /// Print the completed percentage while working
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Args)]
struct ResizeArgs {
    path: PathBuf,
    #[arg(value_parser = parse_size_arg)]
    size: u64,
    /// Print the completed percentage while working
    #[arg(long)]
    progress: bool,
}

#[derive(Debug, Args)]
struct RepairArgs {
    path: PathBuf,
    /// Report the problems without writing anything
    #[arg(long, short = 'n')]
    dry_run: bool,
}

fn parse_size_arg(s: &str) -> Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

/// Returns a progress callback printing to stderr when `enabled`.
fn progress_printer(enabled: bool) -> impl FnMut(u32) {
    move |percent| {
        if enabled {
            eprint!("\r{percent:3}%");
            if percent == 100 {
                eprintln!();
            }
        }
    }
}

fn open_readonly(path: &PathBuf) -> anyhow::Result<Vhd> {
    let config = ImageConfig {
        readonly: true,
        ..Default::default()
    };
    Vhd::open(path, config).with_context(|| format!("Error opening {}", path.display()))
}

fn open_writable(path: &PathBuf) -> anyhow::Result<Vhd> {
    Vhd::open(path, ImageConfig::default())
        .with_context(|| format!("Error opening {}", path.display()))
}

fn create(args: CreateArgs) -> anyhow::Result<()> {
    let disk_type = DiskType::from(args.image_type);
    let parent = match (&args.parent, disk_type) {
        (Some(path), DiskType::Differencing) => Some(open_readonly(path)?),
        (None, DiskType::Differencing) => {
            return Err(anyhow!("A differencing image needs --parent"))
        }
        (Some(_), _) => return Err(anyhow!("--parent only applies to differencing images")),
        (None, _) => None,
    };

    let size = match (args.size, &parent) {
        (Some(size), _) => size,
        (None, Some(parent)) => parent.size(),
        (None, None) => return Err(anyhow!("Missing --size")),
    };

    let mut options = CreateOptions::new(disk_type, size);
    options.block_size = match args.block_size {
        Some(block_size) => u32::try_from(block_size)
            .map_err(|_| anyhow!("Block size {} is too large", block_size))?,
        None => DEFAULT_BLOCK_SIZE,
    };
    if let (Some(parent), Some(path)) = (&parent, &args.parent) {
        options.parent = Some(ParentInfo {
            uuid: parent.uuid(),
            timestamp: parent.timestamp(),
            path: std::fs::canonicalize(path)
                .with_context(|| format!("Error resolving {}", path.display()))?,
        });
    }

    let vhd = Vhd::create_path(&args.path, &options)
        .with_context(|| format!("Error creating {}", args.path.display()))?;
    println!("{} {}", vhd.uuid(), args.path.display());
    Ok(())
}

fn info(args: ImageArgs) -> anyhow::Result<()> {
    let mut config = ImageConfig::parse(&args.options).context("Error parsing --options")?;
    config.readonly = true;
    let vhd = Vhd::open(&args.path, config)
        .with_context(|| format!("Error opening {}", args.path.display()))?;

    let info = serde_json::json!({
        "path": args.path,
        "disk_type": vhd.disk_type(),
        "size": vhd.size(),
        "geometry": vhd.geometry(),
        "uuid": vhd.uuid().to_string(),
        "timestamp": vhd.timestamp(),
        "block_size": vhd.block_size(),
        "allocated_blocks": vhd.allocated_blocks(),
        "end_of_data": vhd.eof(),
        "file_size": vhd.file_size(),
        "parent_uuid": vhd.parent_uuid().map(|u| u.to_string()),
        "parent_timestamp": vhd.parent_timestamp(),
        "parent_filename": vhd.parent_filename(),
        "parent_locators": vhd.parent_locator_paths().unwrap_or_default(),
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn compact(args: CompactArgs) -> anyhow::Result<()> {
    let parent = args.parent.as_ref().map(open_readonly).transpose()?;
    let mut vhd = open_writable(&args.path)?;
    let mut progress = progress_printer(args.progress);
    let stats = vhd
        .compact_with_progress(
            parent.as_ref().map(|p| p as &dyn vhd::ParentReader),
            &mut progress,
        )
        .with_context(|| format!("Error compacting {}", args.path.display()))?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn resize(args: ResizeArgs) -> anyhow::Result<()> {
    let mut vhd = open_writable(&args.path)?;
    vhd.resize_with_progress(args.size, &mut progress_printer(args.progress))
        .with_context(|| format!("Error resizing {}", args.path.display()))
}

fn repair(args: RepairArgs) -> anyhow::Result<()> {
    let report = vhd::repair(&args.path, args.dry_run)
        .with_context(|| format!("Error repairing {}", args.path.display()))?;
    for message in &report.messages {
        println!("{message}");
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let result = match cli.command {
        Command::Create(args) => create(args),
        Command::Info(args) => info(args),
        Command::Compact(args) => compact(args),
        Command::Resize(args) => resize(args),
        Command::Repair(args) => repair(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:?}");
        process::exit(1);
    }
}
