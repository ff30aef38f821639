//! This module defines types used to configure the engine and its parts.
//!
//! Mirrors the split `cratetorrent::conf::Conf` used: an engine-wide part
//! (peers, encryption) and a per-subsystem part (filesystem roots). `Conf`
//! is built once from parsed CLI flags and handed to [`crate::engine::Engine`]
//! -- the engine itself never re-parses arguments or reaches for global
//! state.

use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub paths: PathConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults for everything but
    /// the peer list, which only the caller can sensibly provide.
    pub fn new(peers: Vec<Ipv4Addr>) -> Self {
        Self {
            engine: EngineConf::new(peers),
            paths: PathConf::default(),
        }
    }
}

/// Configuration related to the engine's networking and protocol behaviour.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The IPv4 addresses of peers to connect to on startup.
    pub peers: Vec<Ipv4Addr>,
    /// Whether frames are AES-256-CBC encrypted on the wire.
    pub encryption: bool,
    /// Whether BLOCK payloads are gzip-compressed before encryption.
    ///
    /// The original prototype hardcodes this to `false` and never exposes it
    /// as a CLI flag (unlike `--encryption`), so neither does this crate;
    /// see DESIGN.md.
    pub compression: bool,
    /// How long the outbox waits for an off-signal between connect attempts
    /// while reconnecting. The connect itself is retried with no backoff
    /// (per §4.2); this only bounds how quickly a shutdown is noticed.
    pub connect_retry_interval: Duration,
    /// How often the scanner re-walks the share directory looking for new or
    /// modified files.
    pub scan_interval: Duration,
    /// Outbox queue depth above which a reader throttles new block reads for
    /// that peer.
    pub backpressure_queue_len: usize,
}

impl EngineConf {
    pub fn new(peers: Vec<Ipv4Addr>) -> Self {
        Self {
            peers,
            encryption: false,
            compression: false,
            connect_retry_interval: Duration::from_millis(200),
            scan_interval: Duration::from_secs(1),
            backpressure_queue_len: 5,
        }
    }
}

/// Filesystem roots the engine reads from and writes state to.
#[derive(Clone, Debug)]
pub struct PathConf {
    /// Directory whose contents are shared with peers.
    pub share_dir: PathBuf,
    /// Directory holding persisted state and in-progress downloads.
    pub temp_dir: PathBuf,
}

impl PathConf {
    pub fn file_info_dir(&self) -> PathBuf {
        self.temp_dir.join("file_info")
    }

    pub fn download_info_dir(&self) -> PathBuf {
        self.temp_dir.join("download_info")
    }

    pub fn downloading_dir(&self) -> PathBuf {
        self.temp_dir.join("downloading")
    }

    /// Reserved, unused by any current operation; kept for layout parity
    /// with the original prototype's `temp/directories/`.
    pub fn directories_dir(&self) -> PathBuf {
        self.temp_dir.join("directories")
    }
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            share_dir: PathBuf::from("./share"),
            temp_dir: PathBuf::from("./temp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_match_layout() {
        let paths = PathConf::default();
        assert_eq!(paths.file_info_dir(), PathBuf::from("./temp/file_info"));
        assert_eq!(
            paths.download_info_dir(),
            PathBuf::from("./temp/download_info")
        );
        assert_eq!(paths.downloading_dir(), PathBuf::from("./temp/downloading"));
    }
}
