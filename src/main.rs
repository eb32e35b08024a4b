use anyhow::Result;
use resort_media::{
    app,
    client::{ProgressFn, UploadClient, UploadClientConfig, UploadProgress},
    config::{self, Mode, UploadArgs},
    db,
    services::upload_service::UploadService,
};
use std::{
    io::ErrorKind,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpListener, time::MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = config::AppConfig::from_env_and_args()?;

    let mode = match mode {
        Mode::Upload(args) => return run_upload(args).await,
        other => other,
    };

    tracing::info!("Starting resort-media with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);
    db::run_migrations(&db).await?;

    // --- Handle migration mode ---
    if matches!(mode, Mode::Migrate) {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let store = cfg.storage.connect();
    tracing::info!("Using {} object store", store.name());
    let service = UploadService::new(db.clone(), store).with_session_ttl(cfg.session_ttl);
    spawn_session_sweeper(service.clone(), cfg.session_ttl, cfg.sweep_interval());

    // --- Build router ---
    let router = app(service, cfg.max_request_bytes);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router).await?;

    Ok(())
}

/// Periodically drop abandoned upload sessions. A zero TTL disables it.
fn spawn_session_sweeper(service: UploadService, ttl: Duration, every: Duration) {
    if ttl.is_zero() {
        tracing::info!("Stale session sweeping disabled");
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service.sweep_stale_sessions(ttl).await {
                Ok(0) => {}
                Ok(swept) => tracing::info!("Swept {} stale upload sessions", swept),
                Err(err) => tracing::warn!("Stale session sweep failed: {}", err),
            }
        }
    });
}

/// `resort-media upload`: send files to a running server.
async fn run_upload(args: UploadArgs) -> Result<()> {
    let client = UploadClient::new(UploadClientConfig {
        endpoint: args.endpoint.clone(),
        chunk_threshold: args.chunk_threshold,
        chunk_size: args.chunk_size,
    })?;

    // Log once per file per 10% step.
    let last_step = Arc::new(AtomicUsize::new(usize::MAX));
    let on_progress: ProgressFn = Arc::new(move |p: UploadProgress| {
        let step = p.file_index * 100 + (p.percent / 10.0).floor() as usize;
        if last_step.swap(step, Ordering::Relaxed) != step {
            tracing::info!("{}: {:.0}%", p.file_name, p.percent);
        }
    });

    let results = client.upload_paths(&args.files, on_progress).await;

    let mut failed = 0;
    for (path, result) in args.files.iter().zip(results) {
        match result {
            Ok(record) => println!("{}", serde_json::to_string(&record)?),
            Err(err) => {
                failed += 1;
                tracing::error!("{}: {}", path.display(), err);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} uploads failed", failed, args.files.len());
    }
    Ok(())
}
