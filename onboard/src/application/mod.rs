pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use onboard_core::Config;
use onboard_core::error::Result;
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    init_tracing(&cfg.log.level);

    match cli.command {
        Commands::Pack {
            input,
            out_dir,
            slice_size,
            parallelism,
            parent_path,
            no_checksum,
            remote,
        } => handlers::handle_pack(
            cfg,
            input,
            handlers::PackOverrides {
                out_dir,
                slice_size,
                parallelism,
                parent_path,
                no_checksum,
                remote,
            },
        ),
        Commands::Restore {
            input,
            dest,
            parallelism,
            remote,
        } => handlers::handle_restore(cfg, input, dest, parallelism, remote),
        Commands::Upload {
            input_dir,
            endpoint,
        } => handlers::handle_upload(cfg, input_dir, endpoint),
        Commands::Task {
            descriptors,
            out_dir,
            name,
            auto,
            manual,
            miner,
            dataset,
            description,
            max_copy_number,
        } => handlers::handle_task(
            cfg,
            handlers::TaskArgs {
                descriptors,
                out_dir,
                name,
                auto,
                manual,
                miner,
                dataset,
                description,
                max_copy_number,
            },
        ),
        Commands::Deal { task_id } => handlers::handle_deal(cfg, &task_id),
        Commands::Auto => handlers::handle_auto(cfg),
        Commands::Status { task_id, json } => handlers::handle_status(cfg, &task_id, json),
        Commands::ServeEncoder { listen } => handlers::handle_serve_encoder(cfg, &listen),
    }
}
