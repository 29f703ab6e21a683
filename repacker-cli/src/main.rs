use clap::{Parser, Subcommand};
use std::path::PathBuf;

use repacker_core::{extract_segment, list_segments, lzkn64, run, CodecKind, RepackSettings};

#[derive(Debug, Parser)]
#[command(
    name = "ni-repack",
    version,
    about = "Patch and repack the Nisitenma-Ichigo file table of N64 ROMs"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply an edit manifest and write the repacked ROM.
    Patch {
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// JSON manifest of {"segment": {"offset": "base64"}} edits.
        #[arg(long)]
        edits: Option<PathBuf>,

        #[arg(long, default_value_t = CodecKind::Lzkn64)]
        codec: CodecKind,

        /// Refuse to patch unless the input ROM has this MD5.
        #[arg(long, value_name = "HEX")]
        md5: Option<String>,

        /// Write a repack log next to the output.
        #[arg(long, default_value_t = false)]
        debug: bool,
    },

    /// Print the file table.
    List { rom: PathBuf },

    /// Write one segment to a file.
    Extract {
        rom: PathBuf,
        id: u32,
        output: PathBuf,

        /// Keep the segment compressed.
        #[arg(long, default_value_t = false)]
        raw: bool,

        #[arg(long, default_value_t = CodecKind::Lzkn64)]
        codec: CodecKind,
    },

    /// LZKN64-compress a file.
    Compress { input: PathBuf, output: PathBuf },

    /// LZKN64-decompress a file.
    Decompress { input: PathBuf, output: PathBuf },
}

fn execute(command: Command) -> repacker_core::Result<()> {
    match command {
        Command::Patch {
            input,
            output,
            edits,
            codec,
            md5,
            debug,
        } => run(RepackSettings {
            input_path: input,
            output_path: output,
            edits_path: edits,
            codec,
            expected_md5: md5,
            debug,
        }),
        Command::List { rom } => {
            let segments = list_segments(std::fs::read(&rom)?)?;
            println!("{:>4}  {:>8}  {:>8}  {:>8}  {:>8}", "id", "start", "end", "packed", "size");
            for s in &segments {
                println!(
                    "{:>4}  {:08X}  {:08X}  {:>8}  {:>8}",
                    s.id, s.start, s.end, s.compressed_len, s.recorded_len
                );
            }
            println!("{} segments", segments.len());
            Ok(())
        }
        Command::Extract {
            rom,
            id,
            output,
            raw,
            codec,
        } => {
            let data = extract_segment(std::fs::read(&rom)?, codec, id, raw)?;
            std::fs::write(&output, data)?;
            Ok(())
        }
        Command::Compress { input, output } => {
            let data = std::fs::read(&input)?;
            std::fs::write(&output, lzkn64::compress(&data))?;
            Ok(())
        }
        Command::Decompress { input, output } => {
            let data = std::fs::read(&input)?;
            std::fs::write(&output, lzkn64::decompress(&data))?;
            Ok(())
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(err) = execute(args.command) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}
