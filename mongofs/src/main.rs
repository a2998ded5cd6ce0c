use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use mongofs::config::{Args, Config};
use mongofs::fuse::{MongoFuse, mount};
use mongofs::logging;
use mongofs::store::mongo::MongoStore;
use mongofs::vfs::fs::MongoFs;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::try_from(Args::parse())?;
    logging::init(config.log_file.as_deref(), config.console)?;

    let store = MongoStore::connect(&config.uri, &config.database, &config.collection)
        .await
        .with_context(|| format!("could not connect to {}", config.uri))?;
    info!(namespace = %store.namespace(), "connected");

    let fs = Arc::new(MongoFs::new(
        Arc::new(store),
        config.cache,
        config.page_size,
    ));

    tokio::fs::create_dir_all(&config.mountpoint)
        .await
        .with_context(|| format!("could not create {}", config.mountpoint.display()))?;
    let mut handle = mount::mount(
        MongoFuse::new(fs.clone()),
        &config.mountpoint,
        config.privileged,
    )
    .await
    .with_context(|| format!("could not mount on {}", config.mountpoint.display()))?;
    info!(mountpoint = %config.mountpoint.display(), "mounted");

    tokio::select! {
        res = &mut handle => {
            if let Err(e) = res {
                error!(error = %e, "fuse session ended with error");
            }
        }
        _ = shutdown_signal() => {
            info!("unmounting");
            if let Err(e) = handle.unmount().await {
                error!(error = %e, "unmount failed");
            }
        }
    }

    let failed = fs.flush_all().await;
    if failed > 0 {
        warn!(failed, "some documents could not be written back");
    }
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
