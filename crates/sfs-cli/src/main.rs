#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use serde::Serialize;
use sfs::{AccessMode, DirEntry, FileKind, FormatOptions, Image, SfsError, Statfs};
use std::env;
use std::io::Write;
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct InspectOutput {
    path: String,
    #[serde(flatten)]
    statfs: Statfs,
    data_start_byte: u64,
    image_bytes: u64,
}

fn main() {
    init_logging();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        print_usage();
        return Ok(());
    };
    debug!(command, args = ?rest, "cli invocation");
    let json = rest.iter().any(|arg| arg == "--json");
    let positional: Vec<&str> = positional_args(rest);

    match command.as_str() {
        "mkfs" => {
            let [image] = expect_args::<1>("mkfs", &positional, "<image>")?;
            let defaults = FormatOptions::default();
            let options = FormatOptions {
                block_size: flag_value(rest, "--block-size")?.unwrap_or(defaults.block_size),
                block_count: flag_value(rest, "--blocks")?.unwrap_or(defaults.block_count),
            };
            mkfs(Path::new(image), &options)
        }
        "inspect" => {
            let [image] = expect_args::<1>("inspect", &positional, "<image>")?;
            inspect(Path::new(image), json)
        }
        "ls" => {
            let [image, path] = expect_args::<2>("ls", &positional, "<image> <path>")?;
            ls(Path::new(image), path, json)
        }
        "mkdir" => {
            let [image, path] = expect_args::<2>("mkdir", &positional, "<image> <path>")?;
            with_image(image, |fs| {
                fs.mkdir(path)
                    .with_context(|| format!("failed to create directory {path}"))
            })
        }
        "touch" => {
            let [image, path] = expect_args::<2>("touch", &positional, "<image> <path>")?;
            with_image(image, |fs| match fs.create(path, FileKind::File) {
                Ok(()) | Err(SfsError::FileAlreadyExists) => Ok(()),
                Err(err) => Err(err).with_context(|| format!("failed to create {path}")),
            })
        }
        "put" => {
            let [image, path, host] =
                expect_args::<3>("put", &positional, "<image> <path> <host-file>")?;
            put(Path::new(image), path, Path::new(host))
        }
        "cat" => {
            let [image, path] = expect_args::<2>("cat", &positional, "<image> <path>")?;
            cat(Path::new(image), path)
        }
        "rm" => {
            let [image, path] = expect_args::<2>("rm", &positional, "<image> <path>")?;
            with_image(image, |fs| {
                fs.unlink(path)
                    .with_context(|| format!("failed to remove {path}"))
            })
        }
        "check" => {
            let [image] = expect_args::<1>("check", &positional, "<image>")?;
            check(Path::new(image), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("sfs\n");
    println!("USAGE:");
    println!("  sfs mkfs <image> [--block-size N] [--blocks N]");
    println!("  sfs inspect <image> [--json]");
    println!("  sfs ls <image> <path> [--json]");
    println!("  sfs mkdir <image> <path>");
    println!("  sfs touch <image> <path>");
    println!("  sfs put <image> <path> <host-file>");
    println!("  sfs cat <image> <path>");
    println!("  sfs rm <image> <path>");
    println!("  sfs check <image> [--json]");
}

// ── Argument helpers ────────────────────────────────────────────────────────

const VALUE_FLAGS: [&str; 2] = ["--block-size", "--blocks"];

/// Arguments that are neither flags nor flag values.
fn positional_args(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        } else if !arg.starts_with("--") {
            out.push(arg.as_str());
        }
    }
    out
}

fn expect_args<'a, const N: usize>(
    command: &str,
    positional: &[&'a str],
    usage: &str,
) -> Result<[&'a str; N]> {
    match <[&str; N]>::try_from(positional) {
        Ok(args) => Ok(args),
        Err(_) => bail!("{command} requires {usage}"),
    }
}

fn flag_value<T: std::str::FromStr>(args: &[String], flag: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(index) = args.iter().position(|arg| arg == flag) else {
        return Ok(None);
    };
    let Some(raw) = args.get(index + 1) else {
        bail!("{flag} requires a value");
    };
    raw.parse()
        .map(Some)
        .with_context(|| format!("invalid value for {flag}: {raw}"))
}

fn open_image(path: &Path) -> Result<Image> {
    Image::open(path).with_context(|| format!("failed to open image {}", path.display()))
}

fn with_image(image: &str, op: impl FnOnce(&Image) -> Result<()>) -> Result<()> {
    let fs = open_image(Path::new(image))?;
    op(&fs)?;
    close_image(fs)
}

fn close_image(fs: Image) -> Result<()> {
    let still_open = fs.close().context("failed to close image")?;
    debug!(still_open, "closed image");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize output")?
    );
    Ok(())
}

// ── Commands ────────────────────────────────────────────────────────────────

fn mkfs(path: &Path, options: &FormatOptions) -> Result<()> {
    Image::init_with(path, options)
        .with_context(|| format!("failed to create image {}", path.display()))?;
    println!(
        "created {} ({} blocks of {} bytes)",
        path.display(),
        options.block_count,
        options.block_size
    );
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let fs = open_image(path)?;
    let statfs = fs.statfs().context("failed to read image summary")?;
    let layout = *fs.layout();
    let output = InspectOutput {
        path: path.display().to_string(),
        data_start_byte: layout.data_start * u64::from(layout.block_size),
        image_bytes: layout.image_len(),
        statfs,
    };

    if json {
        print_json(&output)?;
    } else {
        let s = &output.statfs;
        println!("SimpleFS Inspector");
        println!("image: {}", output.path);
        println!("block_size: {}", s.block_size);
        println!("data_blocks: {}", s.total_blocks);
        println!("free_blocks: {}", s.free_blocks);
        println!("data_start: {} (byte {})", s.data_start, output.data_start_byte);
        println!("inodes: {} ({} free)", s.inode_count, s.free_inodes);
        println!("next_free_block: {}", s.next_free_block);
        println!("next_free_inode: {}", s.next_free_inode);
        println!("dir_mutex_holders: {}", s.dir_mutex_holders);
    }
    close_image(fs)
}

fn ls(image: &Path, path: &str, json: bool) -> Result<()> {
    let fs = open_image(image)?;
    let entries: Vec<DirEntry> = fs
        .read_dir(path)
        .with_context(|| format!("failed to list {path}"))?;
    if json {
        print_json(&entries)?;
    } else {
        for entry in &entries {
            let marker = match entry.kind {
                FileKind::Directory => "d",
                FileKind::File => "-",
            };
            println!("{marker} {:>10} {:>6} {}", entry.size, entry.ino.0, entry.name);
        }
    }
    close_image(fs)
}

fn put(image: &Path, path: &str, host: &Path) -> Result<()> {
    let data =
        std::fs::read(host).with_context(|| format!("failed to read {}", host.display()))?;
    let fs = open_image(image)?;
    match fs.create(path, FileKind::File) {
        Ok(()) | Err(SfsError::FileAlreadyExists) => {}
        Err(err) => return Err(err).with_context(|| format!("failed to create {path}")),
    }
    let fh = fs
        .open_file(path, AccessMode::WriteOnly)
        .with_context(|| format!("failed to open {path}"))?;
    fs.truncate(fh, 0)
        .with_context(|| format!("failed to truncate {path}"))?;
    fs.write(fh, &data)
        .with_context(|| format!("failed to write {} bytes to {path}", data.len()))?;
    fs.close_file(fh)?;
    close_image(fs)
}

fn cat(image: &Path, path: &str) -> Result<()> {
    let fs = open_image(image)?;
    let fh = fs
        .open_file(path, AccessMode::ReadOnly)
        .with_context(|| format!("failed to open {path}"))?;
    let mut stdout = std::io::stdout().lock();
    let mut buf = vec![0_u8; 64 * 1024];
    loop {
        let n = fs
            .read(fh, &mut buf)
            .with_context(|| format!("failed to read {path}"))?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).context("failed to write stdout")?;
    }
    stdout.flush().context("failed to flush stdout")?;
    fs.close_file(fh)?;
    close_image(fs)
}

fn check(image: &Path, json: bool) -> Result<()> {
    let fs = open_image(image)?;
    let report = fs.check().context("check failed")?;
    if json {
        print_json(&report)?;
    } else {
        println!(
            "allocated_blocks: {} free_blocks: {} live_inodes: {}",
            report.allocated_blocks, report.free_blocks, report.live_inodes
        );
        for error in &report.errors {
            println!("ERROR {error}");
        }
    }
    close_image(fs)?;
    if !report.is_clean() {
        bail!("{} consistency problem(s) found", report.errors.len());
    }
    Ok(())
}
