use std::path::PathBuf;
use std::sync::Arc;

use onboard_core::config::EncoderBackend;
use onboard_core::dispatch::DispatchReport;
use onboard_core::domain::CounterpartyId;
use onboard_core::encoder::service;
use onboard_core::error::{OnboardError, Result, UploadError};
use onboard_core::pack::pipeline::descriptors_path;
use onboard_core::task::assembler::export_task;
use onboard_core::{
    Backend, Config, DealTracker, DispatchMode, Dispatcher, FileStore, HttpDealMarket,
    LocalEncoder, RunMode, Store, TaskId, TaskParams, Uploader, assemble, pack_tree,
    read_descriptors, restore, upload_dir,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct PackOverrides {
    pub out_dir: Option<PathBuf>,
    pub slice_size: Option<u64>,
    pub parallelism: Option<usize>,
    pub parent_path: bool,
    pub no_checksum: bool,
    pub remote: Option<String>,
}

pub struct TaskArgs {
    pub descriptors: Option<PathBuf>,
    pub out_dir: Option<PathBuf>,
    pub name: String,
    pub auto: bool,
    pub manual: bool,
    pub miner: Option<String>,
    pub dataset: String,
    pub description: String,
    pub max_copy_number: Option<u32>,
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn use_remote(cfg: &mut Config, url: Option<String>) {
    if let Some(url) = url {
        cfg.encoder.backend = EncoderBackend::Remote;
        cfg.encoder.remote_url = Some(url);
    }
}

fn open_store(cfg: &Config) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(FileStore::open(&cfg.store.path)?))
}

fn dispatcher(cfg: &Config, store: Arc<dyn Store>) -> Result<Dispatcher> {
    let opts = cfg.dispatch_options();
    let market = HttpDealMarket::new(
        &cfg.market.api_url,
        cfg.market.access_token.clone(),
        opts.deal_timeout,
    )?;
    Ok(Dispatcher::new(store, Arc::new(market), opts))
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    raw.parse()
        .map_err(|e| OnboardError::Format(format!("invalid task id {raw:?}: {e}")))
}

fn joined<'a>(ids: impl IntoIterator<Item = &'a CounterpartyId>) -> String {
    ids.into_iter()
        .map(CounterpartyId::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// Print the pass summary; Failed or unfinished pieces become a non-zero exit.
fn finish(report: DispatchReport) -> Result<()> {
    println!("{report}");
    for f in &report.failed {
        let attempted = joined(&f.attempted);
        eprintln!(
            "piece {} failed: {} (attempted: {})",
            f.piece_id,
            f.reason,
            if attempted.is_empty() { "none" } else { attempted.as_str() }
        );
    }
    report.into_result()?;
    Ok(())
}

pub fn handle_pack(mut cfg: Config, input: PathBuf, o: PackOverrides) -> Result<()> {
    if let Some(dir) = o.out_dir {
        cfg.sender.output_dir = dir;
    }
    if let Some(size) = o.slice_size {
        cfg.sender.slice_size_limit = size;
    }
    if let Some(n) = o.parallelism {
        cfg.sender.parallelism = n;
    }
    cfg.sender.parent_path |= o.parent_path;
    if o.no_checksum {
        cfg.sender.generate_checksum = false;
    }
    use_remote(&mut cfg, o.remote);
    cfg.validate()?;

    let backend = Backend::from_config(&cfg.encoder)?;
    info!(input = %input.display(), backend = backend.name(), "packing");
    let report = pack_tree(&input, &cfg.pack_options(), &backend)?;

    for d in &report.descriptors {
        println!(
            "{}\t{}\t{}",
            d.content_id,
            d.byte_size,
            d.archive_path.display()
        );
    }
    for f in &report.failures {
        eprintln!("unit {} failed: {}", f.unit_index, f.error);
    }
    let built = report.into_result()?;
    println!(
        "Packed {} archive(s); listing at {}",
        built.len(),
        descriptors_path(&cfg.sender.output_dir).display()
    );
    Ok(())
}

pub fn handle_restore(
    mut cfg: Config,
    input: PathBuf,
    dest: PathBuf,
    parallelism: Option<usize>,
    remote: Option<String>,
) -> Result<()> {
    use_remote(&mut cfg, remote);
    cfg.validate()?;
    let backend = Backend::from_config(&cfg.encoder)?;
    let report = restore(
        &input,
        &dest,
        &backend,
        parallelism.unwrap_or(cfg.sender.parallelism),
    )?;

    for f in &report.failures {
        eprintln!("{}: {}", f.archive.display(), f.error);
    }
    println!(
        "Restored {} file(s), {} bytes from {} archive(s) into {}",
        report.files.len(),
        report.bytes(),
        report.archives,
        dest.display()
    );
    if !report.failures.is_empty() {
        return Err(OnboardError::Format(format!(
            "{} of {} archives failed to restore",
            report.failures.len(),
            report.archives
        )));
    }
    Ok(())
}

pub fn handle_upload(
    cfg: Config,
    input_dir: Option<PathBuf>,
    endpoint: Option<String>,
) -> Result<()> {
    let dir = input_dir.unwrap_or_else(|| cfg.sender.output_dir.clone());
    let endpoint = endpoint
        .or(cfg.upload.endpoint.clone())
        .ok_or(UploadError::MissingEndpoint)?;
    let uploader = Uploader::new(
        &endpoint,
        cfg.upload.access_token.clone(),
        cfg.upload.timeout(),
    )?;
    info!(dir = %dir.display(), %endpoint, "uploading archives");
    let report = upload_dir(&dir, &uploader)?;

    for d in &report.descriptors {
        if let Some(url) = &d.upload_url {
            println!("{}\t{url}", d.content_id);
        }
    }
    for f in &report.failures {
        eprintln!("{}: {}", f.archive.display(), f.error);
    }
    println!(
        "Uploaded {} archive(s), {} already uploaded; listing at {}",
        report.uploaded,
        report.skipped,
        descriptors_path(&dir).display()
    );
    report.into_result()?;
    Ok(())
}

pub fn handle_task(cfg: Config, args: TaskArgs) -> Result<()> {
    let out_dir = args.out_dir.unwrap_or_else(|| cfg.sender.output_dir.clone());
    let listing = args
        .descriptors
        .unwrap_or_else(|| descriptors_path(&out_dir));
    let descriptors = read_descriptors(&listing)?;

    let mode = if args.auto {
        Some(DispatchMode::Auto)
    } else if args.manual || args.miner.is_some() {
        Some(DispatchMode::Manual)
    } else {
        None
    };
    let params = TaskParams {
        name: args.name,
        miner_id: args.miner,
        dataset_label: args.dataset,
        description: args.description,
        mode,
        max_copy_number: args.max_copy_number.unwrap_or(cfg.sender.max_copy_number),
    };

    let store = open_store(&cfg)?;
    let task = assemble(descriptors, params, store.as_ref())?;
    let exported = export_task(&task, &out_dir)?;
    println!(
        "Task {} ({}) with {} piece(s) written to {}",
        task.task_id,
        task.name,
        task.pieces.len(),
        exported.display()
    );

    match task.mode {
        DispatchMode::Manual => {
            println!("Run `onboard deal {}` to send the proposals", task.task_id);
            Ok(())
        }
        DispatchMode::Auto => {
            let dispatcher = dispatcher(&cfg, store)?;
            let report = runtime()?.block_on(async {
                dispatcher
                    .dispatch_task(task.task_id, RunMode::OneShot, &CancellationToken::new())
                    .await
            })?;
            finish(report)
        }
    }
}

pub fn handle_deal(cfg: Config, task_id: &str) -> Result<()> {
    let task_id = parse_task_id(task_id)?;
    let dispatcher = dispatcher(&cfg, open_store(&cfg)?)?;
    let report = runtime()?.block_on(async {
        dispatcher
            .dispatch_task(task_id, RunMode::OneShot, &CancellationToken::new())
            .await
    })?;
    finish(report)
}

pub fn handle_auto(cfg: Config) -> Result<()> {
    let dispatcher = dispatcher(&cfg, open_store(&cfg)?)?;
    runtime()?.block_on(async {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finishing the current pass");
                stop.cancel();
            }
        });
        dispatcher.run_polling(cancel).await;
    });
    Ok(())
}

pub fn handle_status(cfg: Config, task_id: &str, json: bool) -> Result<()> {
    let task_id = parse_task_id(task_id)?;
    let store = open_store(&cfg)?;
    let task = store.get_task(task_id)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    println!(
        "{} {} mode={:?} created={} pieces={}",
        task.task_id,
        task.name,
        task.mode,
        task.created_at,
        task.pieces.len()
    );
    let tracker = DealTracker::new(store);
    for p in &task.pieces {
        let state = tracker.query(p.piece_id)?;
        println!(
            "  {} {} {:?} {}/{} replicas [{}] pending [{}]",
            p.piece_id,
            p.archive.content_id,
            state.status,
            state.replicas.len(),
            p.replication_target,
            joined(&state.replicas),
            joined(&state.pending),
        );
    }
    Ok(())
}

pub fn handle_serve_encoder(cfg: Config, listen: &str) -> Result<()> {
    if cfg.encoder.backend == EncoderBackend::Remote {
        warn!("[encoder] backend is remote; the service always encodes locally");
    }
    let encoder = LocalEncoder {
        level: cfg.encoder.compression_level,
        min_gain: cfg.encoder.min_gain,
    };
    runtime()?.block_on(async {
        let listener = tokio::net::TcpListener::bind(listen).await?;
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });
        service::serve(listener, encoder, shutdown).await?;
        Ok::<_, OnboardError>(())
    })
}
