//! Vessel CLI
//!
//! Stores files in persistent containers and brings them back from their
//! persisted frames.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};
use vessel::container::{cleanup_stale_temp_files, read_all};
use vessel::crypto::MasterSecret;
use vessel::disposal::{CommitTracker, InMemoryCommitTracker};
use vessel::{persist, Config, ContainerFactory, Result, VesselError};

/// Vessel CLI
#[derive(Parser, Debug)]
#[command(name = "vessel")]
#[command(about = "Composable storage containers with encryption and padding")]
#[command(version)]
struct Args {
    /// Directory for container files (defaults to $VESSEL_TMPDIR or the OS temp dir)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a fresh master secret
    Keygen {
        /// Where to write the 32-byte secret
        out: PathBuf,
    },

    /// Copy a file into a persistent container and save its frame
    Store {
        /// File to store ("-" for stdin)
        input: PathBuf,

        /// Where to write the persisted frame
        #[arg(short, long)]
        state: PathBuf,

        /// Master secret file; enables encryption
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// Pad the stored size to a power of two
        #[arg(short, long)]
        pad: bool,
    },

    /// Resume a container from its frame and print its content
    Load {
        /// Persisted frame
        state: PathBuf,

        /// Master secret file for encrypted containers
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Describe the layers recorded in a frame
    Inspect {
        /// Persisted frame
        state: PathBuf,
    },

    /// Dispose a stored container and delete its frame
    Discard {
        /// Persisted frame
        state: PathBuf,

        /// Master secret file for encrypted containers
        #[arg(short, long)]
        key: Option<PathBuf>,
    },

    /// Remove partial files left behind by crashed writers
    Clean,
}

fn main() {
    // Logs go to stderr; stdout carries `load` output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,vessel=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!(kind = ?e.kind(), "{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Commands::Keygen { out } => {
            let secret = MasterSecret::generate();
            fs::write(&out, secret.as_bytes())?;
            tracing::info!("Wrote master secret to {}", out.display());
        }

        Commands::Store { input, state, key, pad } => {
            let tracker = Arc::new(InMemoryCommitTracker::default());
            let factory = open_factory(args.dir, key.as_deref(), pad, tracker)?;
            let container = factory.make_persistent_container()?;

            let mut output = container.output_stream()?;
            if input.as_os_str() == "-" {
                io::copy(&mut io::stdin().lock(), &mut output)?;
            } else {
                io::copy(&mut fs::File::open(&input)?, &mut output)?;
            }
            output.close()?;

            fs::write(&state, container.persist()?)?;
            tracing::info!("Stored {} bytes in {}", container.size(), container.name());
        }

        Commands::Load { state, key, out } => {
            let tracker = Arc::new(InMemoryCommitTracker::default());
            let factory = open_factory(args.dir, key.as_deref(), false, tracker)?;
            let container = factory.resume(&fs::read(&state)?)?;
            let data = read_all(container.as_ref())?;
            match out {
                Some(path) => fs::write(path, &data)?,
                None => io::stdout().lock().write_all(&data)?,
            }
        }

        Commands::Inspect { state } => {
            for line in persist::describe(&fs::read(&state)?)? {
                println!("{}", line);
            }
        }

        Commands::Discard { state, key } => {
            let tracker = Arc::new(InMemoryCommitTracker::default());
            let factory = open_factory(args.dir, key.as_deref(), false, Arc::clone(&tracker) as Arc<dyn CommitTracker>)?;
            let container = factory.resume(&fs::read(&state)?)?;
            container.dispose()?;
            let deleted = tracker.confirm_commit(tracker.current_commit_id());
            fs::remove_file(&state)?;
            tracing::info!("Discarded {} ({} deferred deletions run)", container.name(), deleted);
        }

        Commands::Clean => {
            let factory = ContainerFactory::open(base_config(args.dir).clean_stale_temp_on_start(false).build())?;
            let removed = cleanup_stale_temp_files(factory.temp_dir())?;
            println!("removed {} stale partial files from {}", removed, factory.temp_dir().display());
        }
    }
    Ok(())
}

fn base_config(dir: Option<PathBuf>) -> vessel::config::ConfigBuilder {
    let builder = Config::builder().force_disk(true).delete_on_exit(false);
    match dir {
        Some(dir) => builder.temp_dir(dir),
        None => builder,
    }
}

fn open_factory(
    dir: Option<PathBuf>,
    key: Option<&Path>,
    pad: bool,
    tracker: Arc<dyn CommitTracker>,
) -> Result<ContainerFactory> {
    let config = base_config(dir).encrypt(key.is_some()).pad(pad).build();
    let mut factory = ContainerFactory::open(config)?.with_tracker(tracker);
    if let Some(path) = key {
        factory = factory.with_secret(read_secret(path)?);
    }
    Ok(factory)
}

fn read_secret(path: &Path) -> Result<MasterSecret> {
    let mut bytes = Vec::new();
    fs::File::open(path)
        .and_then(|mut f| f.read_to_end(&mut bytes))
        .map_err(|e| VesselError::Resource(format!("cannot read key {}: {}", path.display(), e)))?;
    MasterSecret::from_slice(&bytes)
}
