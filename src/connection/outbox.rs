//! The Outbox: the per-peer outbound message queue, per §4.2.
//!
//! State machine: `connecting -> connected -> closed`. On entering
//! `connected`, an Outbox always sends an ENCRYPTION frame followed by a
//! FILE_DICT snapshot before anything else, and filters any FILE_ADDED /
//! FILE_MODIFIED messages that were enqueued before the connection existed
//! (they're redundant, since FILE_DICT already covers them).

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::Framed;

use crate::connection::HubHandle;
use crate::error::Result;
use crate::wire::codec::FrameCodec;
use crate::wire::{Message, MessageType, RawFrame};
use crate::PORT;

enum Command {
    Send(Message),
    EnableEncryption,
    Shutdown,
}

/// A cheap, cloneable capability handle to a running Outbox actor.
#[derive(Clone)]
pub struct OutboxHandle {
    tx: mpsc::UnboundedSender<Command>,
    is_on: Arc<AtomicBool>,
    queue_len: Arc<AtomicUsize>,
}

impl OutboxHandle {
    pub fn send(&self, msg: Message) -> Result<()> {
        self.queue_len.fetch_add(1, Ordering::SeqCst);
        self.tx
            .send(Command::Send(msg))
            .map_err(|_| crate::error::Error::ActorGone)
    }

    pub fn enable_encryption(&self) {
        let _ = self.tx.send(Command::EnableEncryption);
    }

    pub fn is_on(&self) -> bool {
        self.is_on.load(Ordering::SeqCst)
    }

    pub fn queue_size(&self) -> usize {
        self.queue_len.load(Ordering::SeqCst)
    }

    pub fn off(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Spawns an Outbox task for `ip` and returns a handle to it immediately;
/// the connect loop runs in the background.
pub fn spawn(hub: HubHandle, ip: Ipv4Addr) -> OutboxHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let is_on = Arc::new(AtomicBool::new(false));
    let queue_len = Arc::new(AtomicUsize::new(0));
    let handle = OutboxHandle {
        tx,
        is_on: is_on.clone(),
        queue_len: queue_len.clone(),
    };
    let actor = Outbox {
        hub,
        ip,
        cmd_rx: rx,
        is_on,
        queue_len,
        encryption_enabled: Arc::new(AtomicBool::new(false)),
        stashed: Vec::new(),
    };
    tokio::spawn(actor.run());
    handle
}

struct Outbox {
    hub: HubHandle,
    ip: Ipv4Addr,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    is_on: Arc<AtomicBool>,
    queue_len: Arc<AtomicUsize>,
    encryption_enabled: Arc<AtomicBool>,
    /// Messages observed during [`Self::filter_pre_connect_messages`] that
    /// were not FILE_ADDED/FILE_MODIFIED (and so are not filtered out);
    /// replayed first thing in steady state, preserving enqueue order.
    stashed: Vec<Command>,
}

impl Outbox {
    async fn run(mut self) {
        loop {
            let socket = match self.connect().await {
                Some(socket) => socket,
                None => return, // off-signal received while connecting
            };
            self.is_on.store(true, Ordering::SeqCst);
            log::info!("outbox to {} connected", self.ip);

            let mut framed = Framed::new(socket, FrameCodec::new());
            if let Err(e) = self.send_prefix(&mut framed).await {
                log::warn!("outbox to {} failed sending prefix: {}", self.ip, e);
                self.is_on.store(false, Ordering::SeqCst);
                continue;
            }

            if !self.filter_pre_connect_messages() {
                self.is_on.store(false, Ordering::SeqCst);
                return;
            }

            match self.steady_state(&mut framed).await {
                Ok(keep_going) => {
                    self.is_on.store(false, Ordering::SeqCst);
                    if !keep_going {
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("outbox to {} closed: {}", self.ip, e);
                    self.is_on.store(false, Ordering::SeqCst);
                }
            }
        }
    }

    /// Repeatedly attempts `connect` with no backoff until success or an
    /// off-signal arrives on the command channel.
    async fn connect(&mut self) -> Option<TcpStream> {
        loop {
            match TcpStream::connect((self.ip, PORT)).await {
                Ok(socket) => return Some(socket),
                Err(e) => {
                    log::debug!("outbox to {} connect failed: {}", self.ip, e);
                }
            }
            let retry_interval = self.hub.conf().connect_retry_interval;
            match time::timeout(retry_interval, self.cmd_rx.recv()).await {
                Ok(Some(Command::Shutdown)) | Ok(None) => return None,
                Ok(Some(_)) => {}
                Err(_) => {}
            }
        }
    }

    async fn send_prefix(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
    ) -> Result<()> {
        let encryption_preference = self.hub.conf().encryption;
        self.send_frame(
            framed,
            Message::Encryption {
                enabled: encryption_preference,
            },
        )
        .await?;
        if encryption_preference {
            self.encryption_enabled.store(true, Ordering::SeqCst);
        }

        let dict = self.hub.file_center().snapshot().await?;
        self.send_frame(framed, Message::FileDict(dict)).await?;
        Ok(())
    }

    /// Drops any FILE_ADDED/FILE_MODIFIED messages that were enqueued
    /// before this connection existed, since the FILE_DICT just sent
    /// already covers them. Returns `false` if an off-signal was seen.
    fn filter_pre_connect_messages(&mut self) -> bool {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::Send(Message::FileAdded { .. })
                | Command::Send(Message::FileModified { .. }) => {
                    self.queue_len.fetch_sub(1, Ordering::SeqCst);
                }
                Command::Send(_) => {
                    // re-inject a non-filtered message by pushing it back
                    // through a local buffer would require an extra queue;
                    // since this only drains messages queued strictly
                    // before connection, pushing straight back onto the
                    // channel front isn't available on mpsc, so these are
                    // processed immediately once we enter steady state
                    // instead. We stash it and replay first thing.
                    self.stashed.push(cmd);
                }
                Command::EnableEncryption => {
                    self.encryption_enabled.store(true, Ordering::SeqCst);
                }
                Command::Shutdown => return false,
            }
        }
        true
    }

    async fn steady_state(
        &mut self,
        framed: &mut Framed<TcpStream, FrameCodec>,
    ) -> Result<bool> {
        for cmd in std::mem::take(&mut self.stashed) {
            if let Command::Send(msg) = cmd {
                self.send_frame(framed, msg).await?;
                self.queue_len.fetch_sub(1, Ordering::SeqCst);
            }
        }

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Send(msg) => {
                    self.send_frame(framed, msg).await?;
                    self.queue_len.fetch_sub(1, Ordering::SeqCst);
                }
                Command::EnableEncryption => {
                    self.encryption_enabled.store(true, Ordering::SeqCst);
                }
                Command::Shutdown => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Transform pipeline: compress (BLOCK only, if enabled), then encrypt
    /// (everything but ENCRYPTION frames, if enabled), then frame.
    async fn send_frame(
        &self,
        framed: &mut Framed<TcpStream, FrameCodec>,
        msg: Message,
    ) -> Result<()> {
        let msg_type = msg.msg_type();
        let mut payload = msg.encode_payload()?;

        if msg.is_compressible() && self.hub.conf().compression {
            payload = crate::wire::compress::compress(&payload)?;
        }
        if msg.is_encryptable() && self.encryption_enabled.load(Ordering::SeqCst) {
            payload = self.hub.cipher().encrypt(&payload);
        }

        framed
            .send(RawFrame {
                msg_type,
                payload,
            })
            .await?;
        Ok(())
    }
}
