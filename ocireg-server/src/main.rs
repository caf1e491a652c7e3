use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use ocireg_remote::{HttpBackend, Resolver, ServiceManager};
use ocireg_server::{build_router, AppState, Config};
use ocireg_store::{BlobStore, MappingIndex, UploadTable};

const SOURCE_NAME: &str = "ocireg";

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    env_logger::init();
    let config = Config::parse();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal startup error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = Arc::new(BlobStore::open(&config.storage_dir)?);
    let mapping = Arc::new(MappingIndex::open(&config.mapping_file, !config.mapping_lenient).await?);
    let uploads = UploadTable::new(store.clone());

    let backend = Arc::new(HttpBackend::new(
        config.rpc_url(),
        config.warm_storage_address(),
        SOURCE_NAME,
    )?);
    let services = Arc::new(ServiceManager::new(backend, SOURCE_NAME));
    let resolver = Resolver::new(store.clone(), services.clone());

    let state = Arc::new(AppState {
        store,
        mapping,
        uploads,
        services: services.clone(),
        resolver,
    });

    let app = build_router(state);
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("ocireg-server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("draining remote services");
    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining");
}
