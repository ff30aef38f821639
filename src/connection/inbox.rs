//! The Inbox: the per-peer inbound frame reader and dispatcher, per §4.3.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::connection::{HubHandle, OutboxHandle};
use crate::error::Result;
use crate::wire::codec::FrameCodec;
use crate::wire::{Message, MessageType};

enum Command {
    Shutdown,
}

/// A cheap, cloneable capability handle to a running Inbox actor.
#[derive(Clone)]
pub struct InboxHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl InboxHandle {
    pub fn off(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

pub fn spawn(
    hub: HubHandle,
    peer_ip: Ipv4Addr,
    socket: TcpStream,
    paired_outbox: OutboxHandle,
) -> InboxHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = Inbox {
        hub,
        peer_ip,
        socket: Framed::new(socket, FrameCodec::new()),
        decrypt_active: Arc::new(AtomicBool::new(false)),
        paired_outbox,
        cmd_rx: rx,
    };
    tokio::spawn(actor.run());
    InboxHandle { tx }
}

struct Inbox {
    hub: HubHandle,
    peer_ip: Ipv4Addr,
    socket: Framed<TcpStream, FrameCodec>,
    decrypt_active: Arc<AtomicBool>,
    paired_outbox: OutboxHandle,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Inbox {
    async fn run(mut self) {
        loop {
            tokio::select! {
                frame = self.socket.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            if let Err(e) = self.dispatch(frame).await {
                                log::warn!("inbox {} dispatch error: {}", self.peer_ip, e);
                            }
                        }
                        Some(Err(e)) => {
                            log::info!("inbox {} closed: {}", self.peer_ip, e);
                            return;
                        }
                        None => {
                            log::info!("inbox {} connection closed", self.peer_ip);
                            return;
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("inbox {} shut down", self.peer_ip);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: crate::wire::RawFrame) -> Result<()> {
        let decrypt = self.decrypt_active.load(Ordering::SeqCst)
            && frame.msg_type != MessageType::Encryption;
        let mut payload = frame.payload;
        if decrypt {
            payload = self.hub.cipher().decrypt(&payload)?;
        }
        if frame.msg_type == MessageType::Block && self.hub.conf().compression {
            payload = crate::wire::compress::decompress(&payload)?;
        }

        let msg = Message::decode(frame.msg_type, &payload)?;
        match msg {
            Message::Encryption { enabled } => {
                if enabled {
                    self.decrypt_active.store(true, Ordering::SeqCst);
                    self.paired_outbox.enable_encryption();
                }
            }
            Message::FileDict(dict) => {
                self.hub
                    .download()
                    .file_dict(self.peer_ip, dict)
                    .await?;
            }
            Message::FileAdded { path, info } => {
                self.hub
                    .download()
                    .file_added(self.peer_ip, path, info)
                    .await?;
            }
            Message::FileModified { path, info } => {
                self.hub
                    .download()
                    .file_modified(self.peer_ip, path, info)
                    .await?;
            }
            Message::BlockRequest { block_index, path } => {
                self.hub.file_center().request_block(
                    path,
                    block_index,
                    self.paired_outbox.clone(),
                )?;
            }
            Message::Block {
                block_index,
                path,
                data,
            } => {
                self.hub.download().block(block_index, path, data).await?;
            }
        }
        Ok(())
    }
}
