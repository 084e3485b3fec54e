use std::sync::Arc;

use clap::Parser;
use litbase::{
    CancelFlag,
    DataDir,
    Error,
    Result,
    SyncConfig,
    SyncMode,
    SyncReport,
    Synchronizer,
    cli::{self, Cli, Command},
    data_dir::CachePaths,
    demo,
    embedding,
    enrichment::{ResilientClient, checkpoint::Checkpoint},
    library::{DirectoryLibrary, SourceLibrary},
    quality::ScoreMode,
    record::RecordStore,
    search::{self, KnowledgeBase},
    text_cache::RedbTextCache,
    vector_cache::{FileVectorCache, VectorCache},
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("LITBASE_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let mut config = SyncConfig::load(&data_dir.config_file())?;
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }

    match cli.command {
        Command::Sync(args) => {
            cmd_sync(&data_dir, config, &args, SyncMode::Incremental)?;
        }
        Command::Rebuild(args) => {
            cmd_sync(&data_dir, config, &args, SyncMode::FullRebuild)?;
        }
        Command::Seed(args) => {
            cmd_seed(&data_dir, &args)?;
        }
        Command::Search(args) => {
            cmd_search(&data_dir, &config, cli.model.as_deref(), &args)?;
        }
        Command::Status(args) => {
            cmd_status(&data_dir, &config, args.json)?;
        }
        Command::Completions(_) => {}
    }

    Ok(())
}

fn cmd_sync(
    data_dir: &DataDir,
    mut config: SyncConfig,
    args: &cli::SyncArgs,
    mode: SyncMode,
) -> Result<()> {
    if args.offline {
        config.offline = true;
    }
    let root = args
        .library
        .clone()
        .or_else(|| config.library.clone())
        .ok_or_else(|| {
            Error::Config(
                "no library given; pass --library or set `library` in \
                 config.toml"
                    .into(),
            )
        })?;
    let library = DirectoryLibrary::open(&root)?;

    let report = run(data_dir, &data_dir.caches(), &library, &config, mode)?;
    print_report(&report, args.json)
}

fn cmd_seed(data_dir: &DataDir, args: &cli::SeedArgs) -> Result<()> {
    if !args.force {
        let store = RecordStore::load(&data_dir.metadata_file())?;
        if !store.is_empty() {
            return Err(Error::Config(format!(
                "knowledge base already has {} records; pass --force to \
                 replace it with the demo corpus",
                store.len()
            )));
        }
    }

    let config = SyncConfig::demo();
    let library = demo::demo_library();
    let report = run(
        data_dir,
        &data_dir.demo_caches(),
        &library,
        &config,
        SyncMode::Seed,
    )?;
    print_report(&report, args.json)
}

/// Open the caches and embedder and drive one synchronization on a tokio
/// runtime. Ctrl-C stops the run after the current batch.
fn run(
    data_dir: &DataDir,
    caches: &CachePaths,
    library: &dyn SourceLibrary,
    config: &SyncConfig,
    mode: SyncMode,
) -> Result<SyncReport> {
    let text_cache = RedbTextCache::open(&caches.text_db)?;
    let embedder = embedding::embedder_for(&config.model);
    let vector_cache = FileVectorCache::open(
        &caches.vector_meta,
        &caches.vector_blob,
        embedder.model_id(),
    )?;
    let cancel = CancelFlag::new();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let handler = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, stopping after the current batch");
                    cancel.cancel();
                }
            })
        };

        let mut sync = Synchronizer::new(
            data_dir,
            library,
            &text_cache,
            &vector_cache,
            embedder.as_ref(),
            config,
        )
        .with_cancel(cancel.clone());
        if !config.offline && mode != SyncMode::Seed {
            sync = sync
                .with_metadata_client(Arc::new(ResilientClient::http(config)?));
        }

        let result = sync.run(mode).await;
        handler.abort();
        result
    })
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{report}");
    }
    if report.resumable {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn cmd_search(
    data_dir: &DataDir,
    config: &SyncConfig,
    model_override: Option<&str>,
    args: &cli::SearchArgs,
) -> Result<()> {
    let kb = KnowledgeBase::open(data_dir)?;
    // Without an explicit --model, query with whatever built the index.
    let model = model_override
        .map(str::to_string)
        .or_else(|| kb.records().model_id.clone())
        .unwrap_or_else(|| config.model.clone());
    let embedder = embedding::embedder_for(&model);

    let hits =
        kb.search(embedder.as_ref(), &args.query, args.count, args.min_score)?;
    if args.json {
        search::format_json(&hits, &args.query)
    } else {
        search::format_human(&hits);
        Ok(())
    }
}

fn cmd_status(
    data_dir: &DataDir,
    config: &SyncConfig,
    json: bool,
) -> Result<()> {
    let store = RecordStore::load(&data_dir.metadata_file())?;
    let model = store.model_id.clone().unwrap_or_else(|| config.model.clone());
    let text_entries = RedbTextCache::count_entries(&data_dir.text_cache_db())?;
    let vector_entries = FileVectorCache::open(
        &data_dir.vector_cache_meta(),
        &data_dir.vector_cache_blob(),
        &model,
    )?
    .len();
    let checkpointed = Checkpoint::load(&data_dir.checkpoint_file())?
        .processed
        .len();
    let degraded = store
        .records
        .iter()
        .filter(|r| {
            r.quality
                .as_ref()
                .is_some_and(|q| q.mode == ScoreMode::Heuristic)
        })
        .count();

    if json {
        let status = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "model": model,
            "records": store.len(),
            "ids_assigned": store.total_count,
            "heuristic_scores": degraded,
            "index_generation": store.index_generation,
            "text_cache_entries": text_entries,
            "vector_cache_entries": vector_entries,
            "resumable_records": checkpointed,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Model: {model}");
        println!(
            "Records: {} ({} IDs assigned, {degraded} heuristic scores)",
            store.len(),
            store.total_count
        );
        match store.index_generation {
            Some(generation) => println!("Index generation: {generation}"),
            None => println!("Index generation: none"),
        }
        println!("Text cache: {text_entries} entries");
        println!("Vector cache: {vector_entries} entries");
        if checkpointed > 0 {
            println!(
                "Interrupted enrichment: {checkpointed} records checkpointed; \
                 run sync to resume"
            );
        }
    }
    Ok(())
}
