use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use humansize::{format_size, BINARY};

use bootimg::{Entry, EntryType, Format, Header, Reader, Writer};

#[derive(Parser)]
#[command(name = "bootimg", version, about = "Inspect, unpack, and pack Android boot images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the sections in a boot image
    Sections {
        /// The boot image, for example 'boot.img'
        image: PathBuf,

        /// Force a format instead of auto-detecting (android, bump, loki)
        #[arg(long)]
        format: Option<String>,
    },

    /// Unpacks every section of a boot image into a directory
    Unpack {
        /// The boot image, for example 'boot.img'
        image: PathBuf,

        /// Directory to put the sections into
        #[arg(long, default_value = "boot")]
        out: PathBuf,

        /// Force a format instead of auto-detecting (android, bump, loki)
        #[arg(long)]
        format: Option<String>,
    },

    /// Packs sections into a new boot image
    Pack {
        /// The boot image to create
        image: PathBuf,

        /// Output format (android or bump)
        #[arg(long, default_value = "android")]
        format: String,

        #[command(flatten)]
        fields: HeaderArgs,

        /// File containing the kernel
        #[arg(long)]
        kernel: Option<PathBuf>,

        /// File containing the ramdisk
        #[arg(long)]
        ramdisk: Option<PathBuf>,

        /// File containing the second bootloader
        #[arg(long)]
        second: Option<PathBuf>,

        /// File containing the device tree
        #[arg(long)]
        dt: Option<PathBuf>,
    },
}

#[derive(Args)]
struct HeaderArgs {
    /// Page size of the target flash partition
    #[arg(long, default_value_t = 2048)]
    page_size: u32,

    /// Board name, at most 15 bytes
    #[arg(long, default_value = "")]
    board: String,

    /// Kernel command line
    #[arg(long, default_value = "")]
    cmdline: String,

    /// Kernel load address
    #[arg(long, default_value_t = 0x1000_8000)]
    kernel_addr: u32,

    /// Ramdisk load address
    #[arg(long, default_value_t = 0x1100_0000)]
    ramdisk_addr: u32,

    /// Second bootloader load address
    #[arg(long, default_value_t = 0x100f_0000)]
    second_addr: u32,

    /// Kernel tags address
    #[arg(long, default_value_t = 0x1000_0100)]
    tags_addr: u32,
}

fn main() -> ExitCode {
    env_logger::init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Sections { image, format } => sections(&image, format.as_deref()),
        Commands::Unpack { image, out, format } => unpack(&image, &out, format.as_deref()),
        Commands::Pack {
            image,
            format,
            fields,
            kernel,
            ramdisk,
            second,
            dt,
        } => pack(
            &image,
            &format,
            &fields,
            [
                kernel.as_deref(),
                ramdisk.as_deref(),
                second.as_deref(),
                dt.as_deref(),
            ],
        ),
    }
}

fn parse_format(name: &str) -> Result<Format, Box<dyn std::error::Error>> {
    Format::from_name(name).ok_or_else(|| format!("unknown format: {name}").into())
}

fn open_reader(
    image: &Path,
    format: Option<&str>,
) -> Result<Reader<File>, Box<dyn std::error::Error>> {
    let file = File::open(image)?;
    Ok(match format {
        Some(name) => Reader::with_format(file, parse_format(name)?),
        None => Reader::new(file),
    })
}

fn sections(image: &Path, format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = open_reader(image, format)?;
    let header = reader.read_header()?;

    println!("format: {}", reader.format().unwrap());
    if let Some(page_size) = header.page_size {
        println!("page size: {page_size}");
    }
    if let Some(board_name) = &header.board_name {
        if !board_name.is_empty() {
            println!("board name: {board_name}");
        }
    }
    if let Some(cmdline) = &header.kernel_cmdline {
        if !cmdline.is_empty() {
            println!("cmdline: {cmdline}");
        }
    }

    while let Some(entry) = reader.read_entry()? {
        println!(
            "{:<12} {:>12} ({})",
            entry.entry_type,
            entry.size,
            format_size(entry.size, BINARY)
        );
    }

    Ok(())
}

fn unpack(image: &Path, out: &Path, format: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = open_reader(image, format)?;
    reader.read_header()?;

    fs::create_dir_all(out)?;

    while let Some(entry) = reader.read_entry()? {
        let path = out.join(format!("{}.img", entry.entry_type));
        let data = reader.read_entry_data(&entry)?;
        fs::write(&path, data)?;
        println!("{} -> {}", entry.entry_type, path.display());
    }

    Ok(())
}

fn pack(
    image: &Path,
    format: &str,
    fields: &HeaderArgs,
    sources: [Option<&Path>; 4],
) -> Result<(), Box<dyn std::error::Error>> {
    let format = parse_format(format)?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(image)?;
    let mut writer = Writer::new(file, format)?;

    let header = Header {
        kernel_address: Some(fields.kernel_addr),
        ramdisk_address: Some(fields.ramdisk_addr),
        secondboot_address: Some(fields.second_addr),
        kernel_tags_address: Some(fields.tags_addr),
        page_size: Some(fields.page_size),
        board_name: Some(fields.board.clone()),
        kernel_cmdline: Some(fields.cmdline.clone()),
        ..Default::default()
    };
    writer.write_header(&header)?;

    let types = [
        EntryType::Kernel,
        EntryType::Ramdisk,
        EntryType::SecondBoot,
        EntryType::DeviceTree,
    ];
    for (entry_type, source) in types.into_iter().zip(sources) {
        writer.write_entry(&Entry::new(entry_type, 0))?;
        if let Some(path) = source {
            let mut file = File::open(path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                writer.write_data(&buf[..n])?;
            }
        }
        writer.finish_entry()?;
    }
    writer.close()?;

    println!("wrote {} image to {}", format, image.display());

    Ok(())
}
