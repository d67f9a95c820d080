use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use braid::broker::WorkQueueServer;
use braid::hooks::Callbacks;
use braid::reaper::{self, HealthReaper};
use braid::settings::Settings;
use braid::store::JobStore;
use braid::trace;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// The per-host work queue server.
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// seconds between health reaper sweeps (requires a configured
    /// worker_health_check; 0 disables)
    #[arg(long = "reap-every", default_value_t = 0u64)]
    reap_every: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let settings = Arc::new(Settings::load(args.config.as_deref())?);
    trace::init(settings.log_format);

    let store = JobStore::connect(Arc::clone(&settings)).await?;
    if settings.database.run_migrations {
        sqlx::migrate!().run(store.pool()).await?;
        info!("migrations applied");
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    if args.reap_every > 0 {
        match reaper::oracle_from_settings(&settings.worker_health_check) {
            Some(oracle) => {
                let reaper = HealthReaper::new(store.clone(), oracle);
                let every = Duration::from_secs(args.reap_every);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(every) => {}
                        }
                        if let Err(err) = reaper.sweep().await {
                            error!(error = %err, "health reaper sweep failed");
                        }
                    }
                });
            }
            None => {
                error!("--reap-every given but worker_health_check is disabled");
            }
        }
    }

    let hooks = Arc::new(Callbacks::new());
    let server = WorkQueueServer::new(store, hooks);
    server.run(shutdown).await?;
    Ok(())
}
