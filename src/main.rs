mod workers;

use anyhow::Context;
use nwshare::core::config::TransferSettings;
use nwshare::core::persistence::{DiskStore, FileStore};
use nwshare::utils::data_dir;
use nwshare::utils::sos::SignalOfStop;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // RUST_LOG wins over -v when set.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let root = data_dir::resolve(args.conf.as_deref())?;
    std::fs::create_dir_all(&root).with_context(|| format!("creating {}", root.display()))?;
    let settings = args.merge(TransferSettings::load(&data_dir::settings_file(&root))?)?;
    let store: Arc<dyn FileStore> = Arc::new(DiskStore::open(data_dir::store_dir(&root))?);
    info!(event = "startup", data_dir = %root.display(), chunk_size = settings.chunk_size, "nwshare starting");

    match args.command {
        Command::Demo {
            file,
            peers,
            webrtc,
        } => {
            let downloads = dirs::download_dir().unwrap_or_else(|| root.join("downloads"));
            let peers_file = data_dir::peers_file(&root);
            let sos = SignalOfStop::new();
            let sos_clone = sos.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                sos_clone.cancel();
            });
            tokio::select! {
                result = workers::demo::run(&file, peers, webrtc, settings, store, downloads, peers_file) => result,
                _ = sos.wait() => {
                    info!(event = "interrupted", "Interrupted");
                    Ok(())
                }
            }
        }
        Command::History { action } => workers::history::run(action, store.as_ref()),
    }
}
