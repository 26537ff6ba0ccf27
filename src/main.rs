use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use remora::cancel::CancelToken;
use remora::logger::{self, LogLevel};
use remora::torrent::Torrent;
use remora::{download, tracker};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A single-torrent, leech-only BitTorrent client."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Output file path (defaults to the name advertised by the torrent)
    #[arg(short = 'o', long)]
    output: Option<String>,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Error)]
    log_level: LogLevel,

    /// Log outgoing wire messages (debug level only)
    #[arg(long)]
    sent_msg: bool,

    /// Log incoming wire messages (debug level only)
    #[arg(long)]
    recv_msg: bool,

    /// Print a JSON preview of the parsed torrent and exit
    #[arg(long)]
    preview: bool,
}

/// Keep the advertised torrent name from escaping the working directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    let torrent_path = Path::new(&args.torrent);
    if !torrent_path.exists() {
        return Err(anyhow!("could not find torrent file: {}", args.torrent));
    }

    let torrent = Torrent::from_file(torrent_path)?;

    if args.preview {
        println!("{}", torrent.preview_json()?);
        return Ok(());
    }

    let output_name = match args.output.as_deref() {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => sanitize_filename(&torrent.name),
    };
    let output_path = PathBuf::from(&output_name);

    let peers = tracker::announce(&torrent)?;

    // Created (and truncated) up front so a doomed download fails here,
    // before any peer traffic.
    let output_file = File::create(&output_path)
        .with_context(|| format!("could not create output file {output_name:?}"))?;

    let cancel = CancelToken::new();
    download::download(&torrent, peers, &output_file, &cancel)?;

    println!("Saved in {output_name:?}.");

    Ok(())
}

fn main() {
    let args = Args::parse();

    logger::init(args.log_level, args.sent_msg, args.recv_msg);

    if let Err(error) = run(args) {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }

    std::process::exit(0);
}
