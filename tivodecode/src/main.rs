//! tivodecode: decrypt .TiVo recordings to standard MPEG files.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{debug, info};

use tivolibre::io::PrefetchReader;
use tivolibre::{DecoderOptions, TivoDecoder};

mod logging;

/// tivodecode - decrypt a .TiVo recording to a standard MPEG stream
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input .TiVo file; reads stdin when omitted or "-"
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output MPEG file; writes stdout when omitted or "-"
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Media access key (10 digits); remembered for later runs
    #[arg(short, long)]
    mak: Option<String>,

    /// Dump each decrypted metadata chunk to an XML file
    #[arg(short = 'D', long)]
    metadata: bool,

    /// Stop after the envelope; do not decode the video
    #[arg(short = 'x', long)]
    no_video: bool,

    /// Reproduce the byte-exact output of TiVo's DirectShow filter
    #[arg(long)]
    compat_mode: bool,

    /// Show debugging information while decoding
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(args.debug)?;

    let mak = resolve_mak(args.mak.as_deref())?;
    let options = DecoderOptions {
        compatibility_mode: args.compat_mode,
    };

    let input = open_input(args.input.as_deref())?;
    let decoder = TivoDecoder::new(input, &mak, options);

    let chunks = if args.no_video {
        decoder.decode_metadata()?
    } else {
        let mut output = open_output(args.output.as_deref())?;
        let chunks = decoder.decode(&mut output)?;
        output.flush()?;
        chunks
    };
    info!("decoded {} metadata chunks", chunks.len());

    if args.metadata {
        dump_metadata(&chunks, args.output.as_deref())?;
    }

    Ok(())
}

/// Use stdin when no path (or "-") is given; pipes get the background
/// prefetcher so a slow decode never stalls the producer.
fn open_input(path: Option<&Path>) -> io::Result<Box<dyn Read>> {
    match path {
        Some(path) if path != Path::new("-") => {
            Ok(Box::new(BufReader::new(File::open(path)?)))
        }
        _ => Ok(Box::new(PrefetchReader::new(io::stdin()))),
    }
}

fn open_output(path: Option<&Path>) -> io::Result<Box<dyn Write>> {
    match path {
        Some(path) if path != Path::new("-") => {
            Ok(Box::new(BufWriter::new(File::create(path)?)))
        }
        _ => Ok(Box::new(BufWriter::new(io::stdout()))),
    }
}

/// The MAK comes from the command line and is remembered in
/// `~/.config/tivodecode/mak`; later runs may omit it.
fn resolve_mak(arg: Option<&str>) -> Result<String, Box<dyn std::error::Error>> {
    let stored_at = mak_path();
    if let Some(mak) = arg {
        if let Some(path) = &stored_at {
            if let Err(e) = store_mak(path, mak) {
                debug!("could not store MAK at {}: {e}", path.display());
            }
        }
        return Ok(mak.to_string());
    }
    if let Some(path) = &stored_at {
        if let Ok(stored) = fs::read_to_string(path) {
            let stored = stored.trim();
            if !stored.is_empty() {
                debug!("using MAK stored at {}", path.display());
                return Ok(stored.to_string());
            }
        }
    }
    Err("you must provide your media access key (--mak)".into())
}

fn mak_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("tivodecode")
            .join("mak"),
    )
}

fn store_mak(path: &Path, mak: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, mak)
}

/// Write each metadata chunk as `<stem>-NN.xml` next to the output file
/// (or in the working directory when writing to stdout).
fn dump_metadata(chunks: &[Vec<u8>], output: Option<&Path>) -> io::Result<()> {
    let stem = match output {
        Some(path) if path != Path::new("-") => path.with_extension(""),
        _ => PathBuf::from("metadata"),
    };
    for (index, chunk) in chunks.iter().enumerate() {
        let path = PathBuf::from(format!("{}-{index:02}.xml", stem.display()));
        fs::write(&path, chunk)?;
        info!("wrote metadata chunk to {}", path.display());
    }
    Ok(())
}
