//! The per-file Reader: serves `BLOCK_REQUEST`s for one shared file and
//! polls for local modifications, per §4.6.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{self, Duration};

use crate::block::{block_count, BLOCK_SIZE};
use crate::connection::{HubHandle, OutboxHandle};
use crate::error::Result;
use crate::gate::Gate;
use crate::wire::{FileInfo, Message};

pub enum ReaderCommand {
    BlockRequest { block_index: u64, outbox: OutboxHandle },
}

pub type ReaderSender = mpsc::UnboundedSender<ReaderCommand>;

const MODIFY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Reader {
    abs_path: PathBuf,
    file_info_path: PathBuf,
    rel_path: String,
    info: Arc<RwLock<FileInfo>>,
    /// Raised while Download Manager's `update_file` is overwriting this
    /// file; the Reader must neither serve reads nor run a modify check
    /// while this is raised.
    block_counter: Gate,
    hub: HubHandle,
    cmd_rx: mpsc::UnboundedReceiver<ReaderCommand>,
}

impl Reader {
    pub fn new(
        abs_path: PathBuf,
        file_info_path: PathBuf,
        rel_path: String,
        info: Arc<RwLock<FileInfo>>,
        block_counter: Gate,
        hub: HubHandle,
    ) -> (Self, ReaderSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                abs_path,
                file_info_path,
                rel_path,
                info,
                block_counter,
                hub,
                cmd_rx: rx,
            },
            tx,
        )
    }

    pub async fn run(mut self) {
        if let Err(e) = self.run_inner().await {
            log::warn!("reader for {} exited: {}", self.rel_path, e);
        }
    }

    async fn run_inner(&mut self) -> Result<()> {
        let mut pending: Vec<(u64, OutboxHandle)> = Vec::new();
        let mut last_check = time::Instant::now();

        loop {
            self.block_counter.wait_until_clear().await;

            // Drain freshly arrived commands without blocking if none are
            // pending, so modification checks still get a turn.
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                match cmd {
                    ReaderCommand::BlockRequest { block_index, outbox } => {
                        pending.push((block_index, outbox));
                    }
                }
            }

            if let Some((block_index, outbox)) = pending.first().cloned() {
                if !outbox.is_on() {
                    pending.remove(0);
                    continue;
                }
                if outbox.queue_size() > self.hub.conf().backpressure_queue_len {
                    // Requeue by yielding; leave it at the front and try
                    // again next tick once the queue has drained.
                    time::delay_for(Duration::from_millis(20)).await;
                    continue;
                }
                pending.remove(0);
                self.serve_block(block_index, &outbox).await?;
                continue;
            }

            if last_check.elapsed() >= MODIFY_CHECK_INTERVAL {
                last_check = time::Instant::now();
                self.check_modified().await?;
            }

            match time::timeout(Duration::from_millis(100), self.cmd_rx_recv_one())
                .await
            {
                Ok(Some(cmd)) => match cmd {
                    ReaderCommand::BlockRequest { block_index, outbox } => {
                        pending.push((block_index, outbox));
                    }
                },
                Ok(None) => return Ok(()),
                Err(_) => {}
            }
        }
    }

    async fn cmd_rx_recv_one(&mut self) -> Option<ReaderCommand> {
        self.cmd_rx.recv().await
    }

    async fn serve_block(&self, block_index: u64, outbox: &OutboxHandle) -> Result<()> {
        let mut file = match fs::File::open(&self.abs_path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                time::delay_for(Duration::from_millis(200)).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let offset = block_index * BLOCK_SIZE;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        let mut total = 0usize;
        loop {
            let n = file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        outbox.send(Message::Block {
            block_index,
            path: self.rel_path.clone(),
            data: buf,
        })?;
        Ok(())
    }

    async fn check_modified(&mut self) -> Result<()> {
        let meta = match fs::metadata(&self.abs_path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deletion propagation is a non-goal; log and move on.
                log::info!("{} no longer exists locally", self.rel_path);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = meta
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let changed = {
            let info = self.info.read().await;
            mtime != info.mtime
        };
        if !changed {
            return Ok(());
        }

        let new_info = FileInfo {
            mtime,
            last_modified: mtime,
            num_blocks: block_count(meta.len()),
        };
        *self.info.write().await = new_info;
        if let Some(parent) = self.file_info_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.file_info_path, bincode::serialize(&new_info)?).await?;
        self.hub
            .broadcast(Message::FileModified {
                path: self.rel_path.clone(),
                info: new_info,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_len;

    #[test]
    fn block_len_matches_modified_info() {
        let file_len = BLOCK_SIZE + 10;
        assert_eq!(block_len(file_len, 0), BLOCK_SIZE);
        assert_eq!(block_len(file_len, 1), 10);
    }
}
