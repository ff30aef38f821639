//! The Download Manager: the authoritative map of in-progress inbound
//! transfers, per §4.7.
//!
//! Mirrors `file_center`'s actor shape (an unbounded command queue drained
//! inside a single-owner run loop), but additionally reruns a completion
//! sweep over every in-progress entry on each iteration, since a download
//! can become complete purely as a side effect of a `BLOCK` handled a moment
//! earlier, with no further message required to notice it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::{self, Duration};

use crate::block::partial_update_block_count;
use crate::conf::PathConf;
use crate::connection::HubHandle;
use crate::error::{Error, Result};
use crate::wire::{FileDict, FileInfo, Message};

/// How often the manager re-checks every in-progress entry for completion
/// even if no new message arrived, so a completion noticed mid-iteration
/// (e.g. the last block of several expected this round) doesn't wait on the
/// next inbound frame to be adopted.
const COMPLETION_CHECK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    ToDownload,
    Downloading,
    Downloaded,
    ToPartialUpdate,
    PartialUpdating,
    PartialUpdated,
}

impl BlockStatus {
    fn is_in_flight(self) -> bool {
        matches!(
            self,
            BlockStatus::ToDownload
                | BlockStatus::Downloading
                | BlockStatus::ToPartialUpdate
                | BlockStatus::PartialUpdating
        )
    }

    /// Demotes a just-reloaded in-flight status to its not-yet-started
    /// counterpart, per §3's restart/resume semantics.
    fn demoted(self) -> Self {
        match self {
            BlockStatus::Downloading => BlockStatus::ToDownload,
            BlockStatus::PartialUpdating => BlockStatus::ToPartialUpdate,
            other => other,
        }
    }
}

/// One entry of `DOWNLOAD_DICT`: a file's metadata plus the status of each
/// of its blocks. `blocks.len()` always equals `info.num_blocks`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct DownloadEntry {
    info: FileInfo,
    blocks: Vec<BlockStatus>,
}

impl DownloadEntry {
    fn in_flight(&self) -> bool {
        self.blocks.iter().any(|s| s.is_in_flight())
    }

    fn has_partial_updated(&self) -> bool {
        self.blocks.iter().any(|s| *s == BlockStatus::PartialUpdated)
    }

    /// The number of contiguous `PARTIAL_UPDATED` blocks starting at index
    /// 0 -- the boundary of the prefix a partial update actually touched.
    fn leading_partial_updated_count(&self) -> usize {
        self.blocks
            .iter()
            .take_while(|s| **s == BlockStatus::PartialUpdated)
            .count()
    }
}

enum Command {
    FileDict {
        peer: Ipv4Addr,
        dict: FileDict,
    },
    FileAdded {
        peer: Ipv4Addr,
        path: String,
        info: FileInfo,
    },
    FileModified {
        peer: Ipv4Addr,
        path: String,
        info: FileInfo,
    },
    Block {
        block_index: u64,
        path: String,
        data: Vec<u8>,
    },
}

/// A cheap, cloneable capability handle to the running Download Manager
/// actor.
#[derive(Clone)]
pub struct DownloadHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DownloadHandle {
    pub async fn file_dict(&self, peer: Ipv4Addr, dict: FileDict) -> Result<()> {
        self.tx
            .send(Command::FileDict { peer, dict })
            .map_err(|_| Error::ActorGone)
    }

    pub async fn file_added(&self, peer: Ipv4Addr, path: String, info: FileInfo) -> Result<()> {
        self.tx
            .send(Command::FileAdded { peer, path, info })
            .map_err(|_| Error::ActorGone)
    }

    pub async fn file_modified(&self, peer: Ipv4Addr, path: String, info: FileInfo) -> Result<()> {
        self.tx
            .send(Command::FileModified { peer, path, info })
            .map_err(|_| Error::ActorGone)
    }

    pub async fn block(&self, block_index: u64, path: String, data: Vec<u8>) -> Result<()> {
        self.tx
            .send(Command::Block {
                block_index,
                path,
                data,
            })
            .map_err(|_| Error::ActorGone)
    }
}

/// The Download Manager actor itself. Owns `DOWNLOAD_DICT`.
pub struct DownloadManager {
    entries: HashMap<String, DownloadEntry>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    paths: PathConf,
    hub: HubHandle,
}

impl DownloadManager {
    pub fn new(paths: PathConf, hub: HubHandle) -> (Self, DownloadHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                entries: HashMap::new(),
                cmd_rx: rx,
                paths,
                hub,
            },
            DownloadHandle { tx },
        )
    }

    /// Recreates the persisted-state directories, reloads any in-progress
    /// downloads left from a previous run (demoting their in-flight
    /// statuses per §3), then runs forever: drain one message if present,
    /// then sweep every entry for completion.
    pub async fn run(mut self) -> Result<()> {
        fs::create_dir_all(&self.paths.share_dir).await?;
        fs::create_dir_all(self.paths.download_info_dir()).await?;
        fs::create_dir_all(self.paths.downloading_dir()).await?;

        self.reload_persisted().await?;

        let mut tick = time::interval(COMPLETION_CHECK_INTERVAL);
        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await?,
                        None => return Ok(()),
                    }
                }
                _ = tick.tick() => {}
            }
            self.check_completions().await?;
        }
    }

    async fn reload_persisted(&mut self) -> Result<()> {
        let root = self.paths.download_info_dir();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let mut rd = match fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(_) => continue,
            };
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = relative_path(&root, &path);
                let bytes = fs::read(&path).await?;
                let mut download: DownloadEntry = bincode::deserialize(&bytes)?;
                for status in download.blocks.iter_mut() {
                    *status = status.demoted();
                }
                self.persist(&rel, &download).await?;
                self.entries.insert(rel, download);
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::FileDict { peer, dict } => self.handle_file_dict(peer, dict).await,
            Command::FileAdded { peer, path, info } => {
                self.handle_file_added(peer, path, info).await
            }
            Command::FileModified { peer, path, info } => {
                self.handle_file_modified(peer, path, info).await
            }
            Command::Block {
                block_index,
                path,
                data,
            } => self.handle_block(block_index, path, data).await,
        }
    }

    /// For every path the peer advertises that we don't have locally: start
    /// a new download if we've never heard of it, or nudge an existing
    /// stalled entry back into motion. Per §9's open question, a path
    /// already present in the File Center never re-triggers here even if
    /// the peer's info differs -- modification is only ever learned via an
    /// explicit FILE_MODIFIED broadcast.
    async fn handle_file_dict(&mut self, peer: Ipv4Addr, dict: FileDict) -> Result<()> {
        enum Action {
            New,
            ResumePartialUpdate,
            ResumeDownload,
            AlreadyInMotion,
        }

        for (path, info) in dict {
            if self.hub.file_center().contains(&path).await? {
                continue;
            }
            // Decided against an immutable borrow of `self.entries`, which
            // must end before the `&mut self` resume/new calls below.
            let action = match self.entries.get(&path) {
                None => Action::New,
                Some(entry) if entry.blocks.iter().any(|s| *s == BlockStatus::ToPartialUpdate) => {
                    Action::ResumePartialUpdate
                }
                Some(entry) if entry.blocks.iter().any(|s| *s == BlockStatus::ToDownload) => {
                    Action::ResumeDownload
                }
                Some(_) => Action::AlreadyInMotion,
            };
            match action {
                Action::New => self.new_download(peer, path, info).await?,
                Action::ResumePartialUpdate => self.resume_partial_update(peer, &path).await?,
                Action::ResumeDownload => self.resume_download(peer, &path).await?,
                Action::AlreadyInMotion => {}
            }
        }
        Ok(())
    }

    async fn handle_file_added(&mut self, peer: Ipv4Addr, path: String, info: FileInfo) -> Result<()> {
        if self.hub.file_center().contains(&path).await? {
            return Ok(());
        }
        if self.entries.contains_key(&path) {
            return Ok(());
        }
        self.new_download(peer, path, info).await
    }

    async fn handle_file_modified(
        &mut self,
        peer: Ipv4Addr,
        path: String,
        info: FileInfo,
    ) -> Result<()> {
        if self.hub.file_center().contains(&path).await? {
            self.new_partial_update(peer, path, info).await
        } else {
            self.handle_file_added(peer, path, info).await
        }
    }

    async fn handle_block(&mut self, block_index: u64, path: String, data: Vec<u8>) -> Result<()> {
        let entry = match self.entries.get_mut(&path) {
            Some(e) => e,
            None => {
                log::warn!("block {} for unknown download {} dropped", block_index, path);
                return Ok(());
            }
        };
        let idx = block_index as usize;
        let new_status = match entry.blocks.get(idx) {
            Some(BlockStatus::Downloading) => BlockStatus::Downloaded,
            Some(BlockStatus::PartialUpdating) => BlockStatus::PartialUpdated,
            _ => {
                log::warn!(
                    "unexpected block {} for {} in status {:?}, dropping",
                    block_index,
                    path,
                    entry.blocks.get(idx)
                );
                return Ok(());
            }
        };
        write_block_file(&self.paths.downloading_dir(), &path, block_index, &data).await?;
        entry.blocks[idx] = new_status;
        let entry = entry.clone();
        self.persist(&path, &entry).await?;
        Ok(())
    }

    /// Ensures the staging/share directories for `path` exist, marks every
    /// block DOWNLOADING, persists, and requests every block from `peer`.
    async fn new_download(&mut self, peer: Ipv4Addr, path: String, info: FileInfo) -> Result<()> {
        self.ensure_dirs_for(&path).await?;
        let entry = DownloadEntry {
            info,
            blocks: vec![BlockStatus::Downloading; info.num_blocks as usize],
        };
        self.persist(&path, &entry).await?;
        for block_index in 0..info.num_blocks {
            self.hub
                .send_to(peer, Message::BlockRequest { block_index, path: path.clone() })
                .await;
        }
        self.entries.insert(path, entry);
        Ok(())
    }

    /// Marks every block DOWNLOADED (the file is already present and
    /// mostly correct), then flips the leading `N =
    /// ceil(num_blocks * 0.002)` blocks to PARTIAL_UPDATING and requests
    /// just those, modelling the "small prefix changed" case per §4.7.
    async fn new_partial_update(&mut self, peer: Ipv4Addr, path: String, info: FileInfo) -> Result<()> {
        self.ensure_dirs_for(&path).await?;
        let mut blocks = vec![BlockStatus::Downloaded; info.num_blocks as usize];
        let n = partial_update_block_count(info.num_blocks).min(info.num_blocks) as usize;
        for status in blocks.iter_mut().take(n) {
            *status = BlockStatus::PartialUpdating;
        }
        let entry = DownloadEntry { info, blocks };
        self.persist(&path, &entry).await?;
        for block_index in 0..n as u64 {
            self.hub
                .send_to(peer, Message::BlockRequest { block_index, path: path.clone() })
                .await;
        }
        self.entries.insert(path, entry);
        Ok(())
    }

    /// Re-requests every TO_DOWNLOAD block from `peer`, skipping entirely
    /// if that peer isn't currently connected -- the next FILE_DICT from
    /// any other peer will retry, per §4.7.
    async fn resume_download(&mut self, peer: Ipv4Addr, path: &str) -> Result<()> {
        if !self.hub.is_peer_on(peer).await {
            return Ok(());
        }
        let entry = self.entries.get_mut(path).expect("checked by caller");
        let mut to_request = Vec::new();
        for (i, status) in entry.blocks.iter_mut().enumerate() {
            if *status == BlockStatus::ToDownload {
                *status = BlockStatus::Downloading;
                to_request.push(i as u64);
            }
        }
        let entry = entry.clone();
        self.persist(path, &entry).await?;
        for block_index in to_request {
            self.hub
                .send_to(
                    peer,
                    Message::BlockRequest {
                        block_index,
                        path: path.to_string(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Analogous to [`Self::resume_download`] for TO_PARTIAL_UPDATE blocks.
    async fn resume_partial_update(&mut self, peer: Ipv4Addr, path: &str) -> Result<()> {
        if !self.hub.is_peer_on(peer).await {
            return Ok(());
        }
        let entry = self.entries.get_mut(path).expect("checked by caller");
        let mut to_request = Vec::new();
        for (i, status) in entry.blocks.iter_mut().enumerate() {
            if *status == BlockStatus::ToPartialUpdate {
                *status = BlockStatus::PartialUpdating;
                to_request.push(i as u64);
            }
        }
        let entry = entry.clone();
        self.persist(path, &entry).await?;
        for block_index in to_request {
            self.hub
                .send_to(
                    peer,
                    Message::BlockRequest {
                        block_index,
                        path: path.to_string(),
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Sweeps every entry with nothing in flight and adopts it, either as a
    /// freshly-assembled file or as an applied partial update, per §4.7.
    async fn check_completions(&mut self) -> Result<()> {
        let done: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.in_flight())
            .map(|(path, _)| path.clone())
            .collect();

        for path in done {
            let entry = self.entries.remove(&path).expect("just observed present");
            if !entry.has_partial_updated() {
                if let Err(e) = self.adopt_fresh_file(&path, &entry).await {
                    log::warn!("failed to adopt completed download {}: {}", path, e);
                    self.entries.insert(path, entry);
                    continue;
                }
            } else {
                if let Err(e) = self.adopt_partial_update(&path, &entry).await {
                    log::warn!("failed to apply partial update {}: {}", path, e);
                    self.entries.insert(path, entry);
                    continue;
                }
            }
            self.delete_persisted(&path).await?;
        }
        Ok(())
    }

    async fn adopt_fresh_file(&self, path: &str, entry: &DownloadEntry) -> Result<()> {
        let downloading_dir = self.paths.downloading_dir();
        let dest = downloading_dir.join(path);
        assemble_blocks(&dest, &downloading_dir, path, entry.info.num_blocks).await?;
        self.hub
            .file_center()
            .add_file(path.to_string(), entry.info)
            .await?;
        for block_index in 0..entry.info.num_blocks {
            let block_path = block_file_path(&downloading_dir, path, block_index);
            let _ = fs::remove_file(block_path).await;
        }
        let _ = fs::remove_file(dest).await;
        Ok(())
    }

    async fn adopt_partial_update(&self, path: &str, entry: &DownloadEntry) -> Result<()> {
        self.hub
            .file_center()
            .update_file(path.to_string(), entry.info)
            .await?;
        let boundary = entry.leading_partial_updated_count() as u64;
        let downloading_dir = self.paths.downloading_dir();
        for block_index in 0..boundary {
            let block_path = block_file_path(&downloading_dir, path, block_index);
            let _ = fs::remove_file(block_path).await;
        }
        Ok(())
    }

    async fn ensure_dirs_for(&self, path: &str) -> Result<()> {
        if let Some(parent) = self.paths.downloading_dir().join(path).parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = self.paths.share_dir.join(path).parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn persist(&self, path: &str, entry: &DownloadEntry) -> Result<()> {
        let dest = self.paths.download_info_dir().join(path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(dest, bincode::serialize(entry)?).await?;
        Ok(())
    }

    async fn delete_persisted(&self, path: &str) -> Result<()> {
        let dest = self.paths.download_info_dir().join(path);
        let _ = fs::remove_file(dest).await;
        Ok(())
    }
}

fn block_file_path(downloading_dir: &Path, path: &str, block_index: u64) -> std::path::PathBuf {
    downloading_dir.join(format!("{}_block{}", path, block_index))
}

/// Concatenates `<path>_block0.._block{num_blocks-1}` from `downloading_dir`
/// into `dest`, in order, per §4.7's "complete (new file)" adoption step.
async fn assemble_blocks(
    dest: &Path,
    downloading_dir: &Path,
    path: &str,
    num_blocks: u64,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(dest)
        .await?;
    for block_index in 0..num_blocks {
        let block_path = block_file_path(downloading_dir, path, block_index);
        let data = fs::read(&block_path).await?;
        file.write_all(&data).await?;
    }
    Ok(())
}

async fn write_block_file(
    downloading_dir: &Path,
    path: &str,
    block_index: u64,
    data: &[u8],
) -> Result<()> {
    let dest = block_file_path(downloading_dir, path, block_index);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(dest, data).await?;
    Ok(())
}

fn relative_path(root: &Path, full: &Path) -> String {
    full.strip_prefix(root)
        .unwrap_or(full)
        .to_string_lossy()
        .replace(std::path::MAIN_SEPARATOR, "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(blocks: Vec<BlockStatus>) -> DownloadEntry {
        DownloadEntry {
            info: FileInfo {
                mtime: 0,
                last_modified: 0,
                num_blocks: blocks.len() as u64,
            },
            blocks,
        }
    }

    #[test]
    fn fresh_download_has_no_partial_updated_once_all_downloaded() {
        let e = entry(vec![BlockStatus::Downloaded; 3]);
        assert!(!e.in_flight());
        assert!(!e.has_partial_updated());
    }

    #[test]
    fn partial_update_complete_once_no_in_flight_status_remains() {
        let e = entry(vec![
            BlockStatus::PartialUpdated,
            BlockStatus::Downloaded,
            BlockStatus::Downloaded,
        ]);
        assert!(!e.in_flight());
        assert!(e.has_partial_updated());
        assert_eq!(e.leading_partial_updated_count(), 1);
    }

    #[test]
    fn in_flight_statuses_block_completion() {
        let e = entry(vec![BlockStatus::Downloading, BlockStatus::Downloaded]);
        assert!(e.in_flight());
    }

    #[test]
    fn demotion_resets_in_flight_statuses_on_resume() {
        assert_eq!(BlockStatus::Downloading.demoted(), BlockStatus::ToDownload);
        assert_eq!(
            BlockStatus::PartialUpdating.demoted(),
            BlockStatus::ToPartialUpdate
        );
        assert_eq!(BlockStatus::Downloaded.demoted(), BlockStatus::Downloaded);
    }

    #[test]
    fn leading_partial_updated_count_stops_at_first_gap() {
        let e = entry(vec![
            BlockStatus::PartialUpdated,
            BlockStatus::PartialUpdated,
            BlockStatus::Downloaded,
            BlockStatus::PartialUpdated,
        ]);
        assert_eq!(e.leading_partial_updated_count(), 2);
    }

    #[tokio::test]
    async fn assemble_blocks_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let downloading_dir = dir.path().to_path_buf();
        let path = "a/b.txt";
        write_block_file(&downloading_dir, path, 0, b"hello ").await.unwrap();
        write_block_file(&downloading_dir, path, 1, b"world").await.unwrap();

        let dest = downloading_dir.join(path);
        assemble_blocks(&dest, &downloading_dir, path, 2).await.unwrap();

        let assembled = fs::read(&dest).await.unwrap();
        pretty_assertions::assert_eq!(assembled, b"hello world".to_vec());
    }

    #[tokio::test]
    async fn assemble_blocks_fails_if_a_block_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let downloading_dir = dir.path().to_path_buf();
        let path = "solo.bin";
        write_block_file(&downloading_dir, path, 0, b"only block").await.unwrap();

        let dest = downloading_dir.join(path);
        let result = assemble_blocks(&dest, &downloading_dir, path, 2).await;
        assert!(result.is_err());
    }
}
