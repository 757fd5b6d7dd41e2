use bittorrent::{BtEngine, EngineConfig};

#[tokio::main]
async fn main() {
    let format = tracing_subscriber::fmt::format();
    let sub = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .event_format(format)
        .finish();
    tracing::subscriber::set_global_default(sub).unwrap();

    let target = std::env::args()
        .nth(1)
        .expect("usage: bittorrent <path-to-torrent-file-or-magnet-uri>");

    let mut engine = BtEngine::new(EngineConfig::default());

    if target.starts_with("magnet:") {
        let link = engine.add_torrent_from_magnet(&target).await.unwrap();
        tracing::info!(
            "indexed magnet link for {}; metadata fetch over the wire isn't implemented yet",
            hex::encode(link.info_hash)
        );
        return;
    }

    let handle = engine.add_torrent_from_file(&target).await.unwrap();
    tracing::info!("started torrent {}", hex::encode(handle.info_hash));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    handle.shutdown();
}
