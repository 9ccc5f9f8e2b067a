use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "onboard: package datasets into archives and dispatch storage deals",
    long_about = None
)]
pub struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Chunk an input file or directory into content-addressed archives
    Pack {
        input: PathBuf,

        /// Output directory (overrides [sender] output_dir)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Maximum input bytes per archive
        #[arg(long)]
        slice_size: Option<u64>,

        /// Concurrent archive builds
        #[arg(long)]
        parallelism: Option<usize>,

        /// Keep the input directory name as the top level of restored trees
        #[arg(long)]
        parent_path: bool,

        /// Skip the MD5 checksum of each archive
        #[arg(long)]
        no_checksum: bool,

        /// Encode through the encoder service at this URL
        #[arg(long)]
        remote: Option<String>,
    },

    /// Restore an archive, or every archive below a directory
    Restore {
        input: PathBuf,
        dest: PathBuf,

        #[arg(long)]
        parallelism: Option<usize>,

        /// Decode through the encoder service at this URL
        #[arg(long)]
        remote: Option<String>,
    },

    /// Upload the archives listed in <out_dir>/archives.json and record their URLs
    Upload {
        /// Directory holding archives.json (overrides [sender] output_dir)
        #[arg(long, short = 'i')]
        input_dir: Option<PathBuf>,

        /// Gateway base URL (overrides [upload] endpoint)
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Assemble a task from built archives
    Task {
        /// Descriptor listing (defaults to <out_dir>/archives.json)
        #[arg(long)]
        descriptors: Option<PathBuf>,

        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Task name; derived from the task id when empty
        #[arg(long, default_value = "")]
        name: String,

        /// Replicate every piece across eligible counterparties
        #[arg(long, conflicts_with = "manual")]
        auto: bool,

        /// Send every piece to the single miner given by --miner
        #[arg(long)]
        manual: bool,

        /// Target miner id; implies --manual when no mode flag is given
        #[arg(long)]
        miner: Option<String>,

        #[arg(long, default_value = "")]
        dataset: String,

        #[arg(long, default_value = "")]
        description: String,

        /// Replication target for auto dispatch
        #[arg(long)]
        max_copy_number: Option<u32>,
    },

    /// Dispatch deals for a task once and report the outcome
    Deal { task_id: String },

    /// Keep dispatching auto tasks until interrupted
    Auto,

    /// Show the state of every piece of a task
    Status {
        task_id: String,

        /// Print the task as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve the archive encoder over HTTP
    ServeEncoder {
        #[arg(long, default_value = "127.0.0.1:7070")]
        listen: String,
    },
}
