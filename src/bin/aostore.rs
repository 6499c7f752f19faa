//! Inspection CLI for aostore data directories.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use aostore::config::StoreConfig;
use aostore::init_logging;
use aostore::storage::{inspect_chunks, ChunkSummary};
use aostore::txn::{inspect_redo_log, RedoChunkSummary};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "aostore",
    version,
    about = "Inspect aostore map chunks, redo logs and configuration files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        env = "AOSTORE_LOG",
        default_value = "warn",
        help = "Tracing filter, e.g. info or aostore::txn=debug"
    )]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "List the page chunks of one map directory")]
    Chunks {
        #[arg(value_name = "MAP_DIR")]
        dir: PathBuf,
    },

    #[command(about = "Summarize the records of a redo-log directory")]
    Redo {
        #[arg(value_name = "REDO_DIR")]
        dir: PathBuf,
    },

    #[command(about = "Parse and validate a TOML configuration file")]
    Config {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    match cli.command {
        Command::Chunks { dir } => {
            let chunks = inspect_chunks(&dir)?;
            emit(cli.format, &chunks, || print_chunks_text(&chunks))?;
            if chunks.iter().any(|c| c.error.is_some()) {
                std::process::exit(2);
            }
        }
        Command::Redo { dir } => {
            let chunks = inspect_redo_log(&dir)?;
            emit(cli.format, &chunks, || print_redo_text(&chunks))?;
        }
        Command::Config { file } => {
            let config = StoreConfig::from_toml_file(&file)?;
            config.validate()?;
            emit(cli.format, &config, || {
                println!("{}: ok", file.display());
                println!(
                    "  base_dir={} redo_log_dir={} redo_sync={:?}",
                    config.base_dir.display(),
                    config.redo_log_dir,
                    config.redo_sync
                );
                println!(
                    "  page_split_size={} cache_size={} handler_threads={}",
                    config.page_split_size, config.cache_size, config.handler_threads
                );
            })?;
        }
    }
    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_chunks_text(chunks: &[ChunkSummary]) {
    if chunks.is_empty() {
        println!("no chunks");
        return;
    }
    for chunk in chunks {
        match (&chunk.footer, &chunk.error) {
            (Some(footer), _) => println!(
                "chunk {}: {} bytes, {} pages, map_size={} root={} live_chunks={}",
                chunk.id,
                chunk.file_len,
                footer.page_count,
                footer.map_size,
                footer.root_pos,
                footer.live.len()
            ),
            (None, Some(err)) => println!("chunk {}: {} bytes, unreadable: {err}", chunk.id, chunk.file_len),
            (None, None) => println!("chunk {}: {} bytes", chunk.id, chunk.file_len),
        }
    }
}

fn print_redo_text(chunks: &[RedoChunkSummary]) {
    if chunks.is_empty() {
        println!("no redo chunks");
        return;
    }
    for chunk in chunks {
        let torn = chunk.bytes - chunk.valid_bytes;
        println!(
            "redoLog_{}: {} bytes, {} records{}",
            chunk.id,
            chunk.bytes,
            chunk.records,
            if torn > 0 {
                format!(", {torn} torn bytes")
            } else {
                String::new()
            }
        );
        for (map, records) in &chunk.maps {
            println!("  {map}: {records}");
        }
    }
}
