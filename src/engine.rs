//! Wires the File Center, Download Manager, and Connection Hub together and
//! drives the engine for the life of the process.
//!
//! Construction order resolves the source's cyclic module dependencies
//! (hub <-> center <-> downloader, per spec.md §9) without any of the three
//! needing to see an incomplete version of another: the Hub is built first
//! with its two capability slots empty, the File Center and Download
//! Manager are built against that (already-valid) [`HubHandle`], and their
//! handles are wired back into the Hub before anything starts running.

use crate::conf::Conf;
use crate::connection::{listener, Hub, HubHandle};
use crate::download::DownloadManager;
use crate::error::Result;
use crate::file_center::FileCenter;
use crate::wire::crypto::{Cipher, DEFAULT_PASSPHRASE};

/// Starts every actor -- File Center, Download Manager, one Outbox per
/// configured peer, and the Listener -- and blocks for the lifetime of the
/// process on the Listener's accept loop.
pub async fn run(conf: Conf) -> Result<()> {
    let cipher = Cipher::new(DEFAULT_PASSPHRASE);
    let hub: HubHandle = Hub::new(conf.engine.clone(), cipher);

    let (file_center, file_center_handle) = FileCenter::new(
        conf.paths.clone(),
        hub.clone(),
        conf.engine.scan_interval,
    );
    hub.set_file_center(file_center_handle);

    let (download_manager, download_handle) =
        DownloadManager::new(conf.paths.clone(), hub.clone());
    hub.set_download(download_handle);

    tokio::spawn(async move {
        if let Err(e) = file_center.run().await {
            log::error!("file center exited: {}", e);
        }
    });
    tokio::spawn(async move {
        if let Err(e) = download_manager.run().await {
            log::error!("download manager exited: {}", e);
        }
    });

    hub.start().await;

    listener::run(hub).await
}
