//! POLE Dump Binary
//!
//! Inspect and edit compound-file containers from the command line.

use std::fs;
use std::io::Write;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use pole::{Config, PoleError, Storage};
use tracing_subscriber::{fmt, EnvFilter};

/// POLE Dump
#[derive(Parser, Debug)]
#[command(name = "poledump")]
#[command(about = "Inspect and edit OLE2 compound-file containers")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print header and table statistics
    Info {
        /// Container file
        file: String,
    },

    /// List the entries of a folder
    Ls {
        /// Container file
        file: String,

        /// Folder to list
        #[arg(default_value = "/")]
        path: String,

        /// Descend into sub-folders
        #[arg(short, long)]
        recursive: bool,
    },

    /// Write a stream's bytes to stdout
    Cat {
        /// Container file
        file: String,

        /// Stream to dump
        path: String,
    },

    /// Store a local file as a stream (creates the container if missing)
    Put {
        /// Container file
        file: String,

        /// Stream to write
        path: String,

        /// Local file to read the payload from
        source: String,
    },

    /// Remove a stream or folder
    Rm {
        /// Container file
        file: String,

        /// Entry to remove
        path: String,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,pole=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match run(&args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}: {}", args.command.file(), e);
            ExitCode::FAILURE
        }
    }
}

impl Commands {
    fn file(&self) -> &str {
        match self {
            Commands::Info { file }
            | Commands::Ls { file, .. }
            | Commands::Cat { file, .. }
            | Commands::Put { file, .. }
            | Commands::Rm { file, .. } => file,
        }
    }
}

fn run(command: &Commands) -> pole::Result<()> {
    match command {
        Commands::Info { file } => {
            let storage = Storage::open_path(file, Config::default())?;
            let info = storage.info();
            println!("big block size:   {}", info.big_block_size);
            println!("small block size: {}", info.small_block_size);
            println!("threshold:        {}", info.threshold);
            println!("BAT blocks:       {}", info.num_bat);
            println!("SBAT blocks:      {}", info.num_sbat);
            println!("MBAT blocks:      {}", info.num_mbat);
            println!("big blocks:       {}", info.big_blocks);
            println!("small blocks:     {}", info.small_blocks);
            println!("dir entries:      {}", info.dir_entries);
            Ok(())
        }

        Commands::Ls { file, path, recursive } => {
            let storage = Storage::open_path(file, Config::default())?;
            if !storage.is_directory(path) {
                return Err(PoleError::NotFound(path.clone()));
            }
            list(&storage, path, *recursive, 0);
            Ok(())
        }

        Commands::Cat { file, path } => {
            let storage = Storage::open_path(file, Config::default())?;
            let mut stream = storage.stream(path, false)?;
            let data = stream.read_to_end();
            if stream.fail() {
                return Err(PoleError::BadOle(format!("{} could not be read", path)));
            }
            std::io::stdout().write_all(&data)?;
            Ok(())
        }

        Commands::Put { file, path, source } => {
            let payload = fs::read(source)?;
            let config = Config::builder().writable().build();
            let mut storage = if fs::metadata(file).is_ok() {
                Storage::open_path(file, config)?
            } else {
                tracing::info!("creating {}", file);
                Storage::create_path(file, config)?
            };

            if storage.exists(path) {
                storage.delete(path)?;
            }
            let mut stream = storage.create_stream(path)?;
            let written = stream.write(&payload);
            if stream.fail() || written != payload.len() {
                return Err(PoleError::Unknown(format!("short write to {}", path)));
            }
            drop(stream);
            storage.close()?;
            tracing::info!("stored {} bytes in {}", written, path);
            Ok(())
        }

        Commands::Rm { file, path } => {
            let config = Config::builder().writable().build();
            let mut storage = Storage::open_path(file, config)?;
            storage.delete(path)?;
            storage.close()
        }
    }
}

fn list(storage: &Storage, path: &str, recursive: bool, depth: usize) {
    for name in storage.entries(path) {
        let child = format!("{}/{}", path.trim_end_matches('/'), name);
        let printable = name.escape_debug();
        if storage.is_directory(&child) {
            println!("{:indent$}{}/", "", printable, indent = depth * 2);
            if recursive {
                list(storage, &child, recursive, depth + 1);
            }
        } else {
            let size = storage.stream(&child, false).map(|s| s.size()).unwrap_or(0);
            println!("{:indent$}{}  ({} bytes)", "", printable, size, indent = depth * 2);
        }
    }
}
