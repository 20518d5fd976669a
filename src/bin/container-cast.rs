use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use container_cast::assemble::{assemble, AssemblyInput};
use container_cast::cache::{cache_key, read_metadata};
use container_cast::config::{BuildFlags, CastConfig};
use container_cast::format::format_bytes;
use container_cast::locate::locate;
use container_cast::macho::prepare_for_signing;
use container_cast::payload::{ImageConfig, Metadata, Section, SparseRegionSet};
use container_cast::sign;

/// Cast a kernel and filesystem images into a single executable.
#[derive(Parser, Debug)]
#[command(name = "container-cast", version)]
struct Cli {
    /// Verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a self-contained executable
    Cast(CastArgs),
    /// Show what is embedded in an artifact
    Inspect {
        /// Artifact to inspect
        artifact: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CastArgs {
    /// Kernel image
    #[arg(long)]
    kernel: PathBuf,

    /// Init filesystem image (ext4)
    #[arg(long)]
    initfs: PathBuf,

    /// Workload root filesystem image (ext4)
    #[arg(long)]
    rootfs: PathBuf,

    /// OCI image configuration JSON for entrypoint, cmd, env and workdir
    #[arg(long = "image-config")]
    image_config: Option<PathBuf>,

    /// Runtime executable to embed into [default: cast-runner next to this binary]
    #[arg(long)]
    base: Option<PathBuf>,

    /// Output path
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Settings file (TOML)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Workload name [default: output file name]
    #[arg(long)]
    name: Option<String>,

    /// Virtual CPUs
    #[arg(long)]
    cpus: Option<u32>,

    /// Memory, e.g. 512M or 2G
    #[arg(short = 'm', long)]
    memory: Option<String>,

    /// Replace the image entrypoint (space-separated)
    #[arg(long)]
    entrypoint: Option<String>,

    /// Disable networking in the guest
    #[arg(long = "no-network")]
    no_network: bool,

    /// Keep stdin attached
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Allocate a terminal
    #[arg(short = 't', long)]
    tty: bool,

    /// Skip code signing
    #[arg(long = "no-sign")]
    no_sign: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(if cli.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .format_timestamp(None)
        .format_target(false)
        .init();

    match cli.command {
        Commands::Cast(args) => cast(args),
        Commands::Inspect { artifact } => inspect(&artifact),
    }
}

fn cast(args: CastArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => CastConfig::load(path)?,
        None => CastConfig::default(),
    };
    let image = match &args.image_config {
        Some(path) => ImageConfig::load(path)?,
        None => ImageConfig::default(),
    };

    let default_name = args
        .output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cast".to_string());
    let flags = BuildFlags {
        name: args.name.clone(),
        cpus: args.cpus,
        memory: args.memory.clone(),
        entrypoint: args.entrypoint.clone(),
        no_network: args.no_network,
        interactive: args.interactive,
        tty: args.tty,
    };
    let options = config.resolve(&flags, &default_name)?;
    let metadata = Metadata::from_image_config(&image, &options);

    let base = match args.base {
        Some(base) => base,
        None => default_base()?,
    };

    println!("[cast] Assembling {}", args.output.display());
    println!("  Base:   {}", base.display());
    let report = assemble(
        &AssemblyInput {
            base,
            kernel: args.kernel,
            initfs: args.initfs,
            rootfs: args.rootfs,
            metadata,
        },
        &args.output,
    )
    .with_context(|| format!("assembling {}", args.output.display()))?;

    for section in &report.sections {
        if section.logical_size == section.encoded_size {
            println!("  {:<7} {}", section.name, format_bytes(section.logical_size));
        } else {
            println!(
                "  {:<7} {} -> {} (sparse)",
                section.name,
                format_bytes(section.logical_size),
                format_bytes(section.encoded_size)
            );
        }
    }

    println!("[cast] Patching load commands");
    let patch = prepare_for_signing(&args.output)?;
    if !patch.is_macho {
        println!("  Not a Mach-O image, left as-is");
    }

    if args.no_sign {
        println!("[cast] Signing skipped (--no-sign)");
    } else if !patch.is_macho || !sign::signing_supported() {
        println!("[cast] Signing skipped (not supported on this host)");
    } else {
        println!("[cast] Signing");
        let work_dir = args
            .output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        sign::sign_adhoc(&args.output, work_dir)?;
    }

    println!();
    println!(
        "Cast {} ({})",
        args.output.display(),
        format_bytes(std::fs::metadata(&args.output)?.len())
    );
    Ok(())
}

/// `cast-runner` installed alongside this binary.
fn default_base() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to resolve current executable")?;
    let runner = exe.with_file_name("cast-runner");
    if !runner.is_file() {
        bail!(
            "No runtime executable at {}. Pass --base explicitly.",
            runner.display()
        );
    }
    Ok(runner)
}

fn inspect(artifact: &Path) -> Result<()> {
    let located = locate(artifact)?;
    let trailer = located.trailer;
    let mut file =
        File::open(artifact).with_context(|| format!("Failed to open {}", artifact.display()))?;

    println!("Artifact:  {}", artifact.display());
    println!("Trailer:   offset {:#x}", located.offset);
    println!("Cache key: {}", cache_key(&located.raw));
    println!();

    for (name, section) in trailer.sections() {
        println!(
            "{:<7} offset {:#012x}  size {}",
            name,
            section.offset,
            format_bytes(section.size)
        );
        if name != "kernel" {
            let set = sparse_header(&mut file, section)?;
            println!(
                "        logical {}  data {} in {} regions",
                format_bytes(set.logical_size),
                format_bytes(set.data_len()),
                set.regions.len()
            );
        }
    }

    let metadata = read_metadata(&mut file, &located)?;
    println!();
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

fn sparse_header(file: &mut File, section: Section) -> Result<SparseRegionSet> {
    file.seek(SeekFrom::Start(section.offset))?;
    let mut reader = BufReader::new(&*file);
    Ok(SparseRegionSet::read_header(&mut reader)?)
}
