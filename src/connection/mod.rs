//! The Connection Hub: owns the peer table and routes frames between the
//! network and the rest of the engine. Contains no synchronisation logic of
//! its own beyond bookkeeping -- Inbox and Outbox actors do the actual I/O.

pub mod inbox;
pub mod listener;
pub mod outbox;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock};

use tokio::net::TcpStream;
use tokio::sync::RwLock;

pub use inbox::InboxHandle;
pub use outbox::OutboxHandle;

use crate::conf::EngineConf;
use crate::download::DownloadHandle;
use crate::error::Result;
use crate::file_center::FileCenterHandle;
use crate::wire::crypto::Cipher;
use crate::wire::Message;

/// One entry of `PEER_DICT`: the Inbox/Outbox pair for a single remote
/// host. The Outbox always exists once the hub has been started; the Inbox
/// is populated on the first accepted inbound connection from that peer.
pub struct PeerSlot {
    pub inbox: Option<InboxHandle>,
    pub outbox: OutboxHandle,
}

/// Hub construction happens before the File Center and Download Manager
/// actors exist (they each need a [`HubHandle`] themselves, to broadcast and
/// to send requests to peers), so these two capabilities are wired in after
/// the fact via [`Hub::set_file_center`]/[`Hub::set_download`] rather than
/// threaded through the constructor -- this is the "capability handles, not
/// cyclic module dependencies" resolution from spec.md §9.
pub struct Hub {
    peers: RwLock<HashMap<Ipv4Addr, PeerSlot>>,
    conf: EngineConf,
    cipher: Cipher,
    file_center: OnceLock<FileCenterHandle>,
    download: OnceLock<DownloadHandle>,
}

pub type HubHandle = Arc<Hub>;

impl Hub {
    pub fn new(conf: EngineConf, cipher: Cipher) -> HubHandle {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            conf,
            cipher,
            file_center: OnceLock::new(),
            download: OnceLock::new(),
        })
    }

    /// Wires the File Center capability in once it has been constructed.
    /// Called exactly once during engine startup, before [`Hub::start`].
    pub fn set_file_center(&self, file_center: FileCenterHandle) {
        self.file_center
            .set(file_center)
            .unwrap_or_else(|_| panic!("file center already wired"));
    }

    /// Wires the Download Manager capability in once it has been
    /// constructed. Called exactly once during engine startup, before
    /// [`Hub::start`].
    pub fn set_download(&self, download: DownloadHandle) {
        self.download
            .set(download)
            .unwrap_or_else(|_| panic!("download manager already wired"));
    }

    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    pub fn conf(&self) -> &EngineConf {
        &self.conf
    }

    pub fn file_center(&self) -> &FileCenterHandle {
        self.file_center.get().expect("file center not wired yet")
    }

    pub fn download(&self) -> &DownloadHandle {
        self.download.get().expect("download manager not wired yet")
    }

    /// Spawns an Outbox for every peer in the configured peer list. Called
    /// once at startup; the Outbox itself always exists thereafter, even
    /// while disconnected.
    pub async fn start(self: &HubHandle) {
        let peers = self.conf.peers.clone();
        for ip in peers {
            self.ensure_outbox(ip).await;
        }
    }

    async fn ensure_outbox(self: &HubHandle, ip: Ipv4Addr) {
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&ip) {
            let outbox = outbox::spawn(self.clone(), ip);
            peers.insert(ip, PeerSlot { inbox: None, outbox });
        }
    }

    /// Sends a single message to one peer's Outbox. If the peer isn't known
    /// at all (shouldn't happen once `start` has run) this is a no-op, per
    /// §7's "peer not yet connected: skip that peer".
    pub async fn send_to(&self, ip: Ipv4Addr, msg: Message) {
        let peers = self.peers.read().await;
        if let Some(slot) = peers.get(&ip) {
            if let Err(e) = slot.outbox.send(msg) {
                log::warn!("failed to queue message for {}: {}", ip, e);
            }
        } else {
            log::warn!("send_to unknown peer {}", ip);
        }
    }

    /// Whether `ip`'s Outbox is currently connected. Used by the Download
    /// Manager's resume path (§4.7) to skip re-requesting from a peer that
    /// isn't there right now; the next FILE_DICT from any peer retries.
    pub async fn is_peer_on(&self, ip: Ipv4Addr) -> bool {
        let peers = self.peers.read().await;
        peers.get(&ip).map_or(false, |slot| slot.outbox.is_on())
    }

    /// Enqueues a message on every peer Outbox that is currently connected.
    pub async fn broadcast(&self, msg: Message) {
        let peers = self.peers.read().await;
        for (ip, slot) in peers.iter() {
            if slot.outbox.is_on() {
                if let Err(e) = slot.outbox.send(msg.clone()) {
                    log::warn!("failed to broadcast to {}: {}", ip, e);
                }
            }
        }
    }

    /// Called by the Listener on an accepted inbound TCP connection. If the
    /// peer has no Inbox yet, installs a fresh one. Otherwise this is a
    /// reconnect: tear down the old Inbox/Outbox pair and install fresh
    /// ones, per §4.4.
    pub async fn accept(self: &HubHandle, ip: Ipv4Addr, socket: TcpStream) -> Result<()> {
        let mut peers = self.peers.write().await;
        let is_reconnect = peers.get(&ip).map_or(false, |slot| slot.inbox.is_some());

        if is_reconnect {
            if let Some(slot) = peers.remove(&ip) {
                if let Some(inbox) = slot.inbox {
                    inbox.off();
                }
                slot.outbox.off();
            }
        }

        let outbox = outbox::spawn(self.clone(), ip);
        let inbox = inbox::spawn(self.clone(), ip, socket, outbox.clone());
        peers.insert(
            ip,
            PeerSlot {
                inbox: Some(inbox),
                outbox,
            },
        );
        Ok(())
    }
}
