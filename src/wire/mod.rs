//! The framed binary protocol spoken between peers.
//!
//! A frame on the wire is an 8-byte big-endian payload size, a 4-byte
//! big-endian message type, and then that many bytes of payload. The
//! [`codec`] submodule turns that byte stream into [`RawFrame`]s; this
//! module turns [`RawFrame`]s into the typed [`Message`]s the rest of the
//! engine deals with.

pub mod codec;
pub mod compress;
pub mod crypto;

use std::collections::HashMap;
use std::convert::TryInto;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A file's synchronisation metadata, the unit both gossiped on the wire and
/// persisted to disk.
///
/// `mtime` is the last observed local on-disk timestamp; `last_modified` is
/// the value the network has agreed on for this file (it may lag `mtime`
/// until a broadcast goes out, and is restated from a remote peer's value
/// after a pull). `num_blocks` must always equal `block_count(size)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub mtime: i64,
    pub last_modified: i64,
    pub num_blocks: u64,
}

/// The FILE_DICT payload: every path this peer currently shares, mapped to
/// its [`FileInfo`].
pub type FileDict = HashMap<String, FileInfo>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Encryption = 0,
    FileDict = 1,
    FileModified = 2,
    FileAdded = 3,
    BlockRequest = 4,
    Block = 5,
}

impl MessageType {
    pub fn from_u32(n: u32) -> Result<Self> {
        Ok(match n {
            0 => MessageType::Encryption,
            1 => MessageType::FileDict,
            2 => MessageType::FileModified,
            3 => MessageType::FileAdded,
            4 => MessageType::BlockRequest,
            5 => MessageType::Block,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// A frame as it exists on the wire, before its payload has been interpreted
/// (and, if applicable, decrypted/decompressed).
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

/// The application-level messages exchanged between an Inbox/Outbox pair and
/// the rest of the engine.
#[derive(Clone, Debug)]
pub enum Message {
    /// Advertises (or toggles) encryption for the remainder of this channel.
    Encryption { enabled: bool },
    FileDict(FileDict),
    FileAdded { path: String, info: FileInfo },
    FileModified { path: String, info: FileInfo },
    BlockRequest { block_index: u64, path: String },
    Block {
        block_index: u64,
        path: String,
        data: Vec<u8>,
    },
}

impl Message {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Encryption { .. } => MessageType::Encryption,
            Message::FileDict(_) => MessageType::FileDict,
            Message::FileAdded { .. } => MessageType::FileAdded,
            Message::FileModified { .. } => MessageType::FileModified,
            Message::BlockRequest { .. } => MessageType::BlockRequest,
            Message::Block { .. } => MessageType::Block,
        }
    }

    /// Whether compression applies to this message's payload. Per §4.1,
    /// only BLOCK payloads are ever compressed.
    pub fn is_compressible(&self) -> bool {
        matches!(self, Message::Block { .. })
    }

    /// Whether encryption applies to this message's payload. Per §4.1,
    /// every frame except ENCRYPTION itself is eligible.
    pub fn is_encryptable(&self) -> bool {
        !matches!(self, Message::Encryption { .. })
    }

    /// Serializes this message into its wire payload (uncompressed,
    /// unencrypted -- those transforms are applied by the caller around this
    /// encoding, per the send pipeline in §4.2).
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Message::Encryption { enabled } => {
                buf.extend_from_slice(&(*enabled as u32).to_be_bytes());
            }
            Message::FileDict(dict) => {
                buf = bincode::serialize(dict)?;
            }
            Message::FileAdded { path, info } | Message::FileModified { path, info } => {
                encode_path_and_info(&mut buf, path, info)?;
            }
            Message::BlockRequest { block_index, path } => {
                buf.extend_from_slice(&block_index.to_be_bytes());
                buf.extend_from_slice(path.as_bytes());
            }
            Message::Block {
                block_index,
                path,
                data,
            } => {
                buf.extend_from_slice(&block_index.to_be_bytes());
                buf.extend_from_slice(&(path.len() as u64).to_be_bytes());
                buf.extend_from_slice(path.as_bytes());
                buf.extend_from_slice(data);
            }
        }
        Ok(buf)
    }

    /// Parses a raw frame's (already decrypted and, for BLOCK, decompressed)
    /// payload back into a typed message.
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self> {
        Ok(match msg_type {
            MessageType::Encryption => {
                let n = read_u32(payload, 0)?;
                Message::Encryption { enabled: n != 0 }
            }
            MessageType::FileDict => {
                let dict: FileDict = bincode::deserialize(payload)?;
                Message::FileDict(dict)
            }
            MessageType::FileAdded | MessageType::FileModified => {
                let (path, info) = decode_path_and_info(payload)?;
                if msg_type == MessageType::FileAdded {
                    Message::FileAdded { path, info }
                } else {
                    Message::FileModified { path, info }
                }
            }
            MessageType::BlockRequest => {
                let block_index = read_u64(payload, 0)?;
                let path = String::from_utf8_lossy(&payload[8..]).into_owned();
                Message::BlockRequest { block_index, path }
            }
            MessageType::Block => {
                let block_index = read_u64(payload, 0)?;
                let path_len = read_u64(payload, 8)? as usize;
                let path_start = 16;
                let path_end = path_start + path_len;
                let path =
                    String::from_utf8_lossy(&payload[path_start..path_end]).into_owned();
                let data = payload[path_end..].to_vec();
                Message::Block {
                    block_index,
                    path,
                    data,
                }
            }
        })
    }
}

fn encode_path_and_info(buf: &mut Vec<u8>, path: &str, info: &FileInfo) -> Result<()> {
    buf.extend_from_slice(&(path.len() as u64).to_be_bytes());
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(&bincode::serialize(info)?);
    Ok(())
}

fn decode_path_and_info(payload: &[u8]) -> Result<(String, FileInfo)> {
    let path_len = read_u64(payload, 0)? as usize;
    let path_start = 8;
    let path_end = path_start + path_len;
    let path = String::from_utf8_lossy(&payload[path_start..path_end]).into_owned();
    let info: FileInfo = bincode::deserialize(&payload[path_end..])?;
    Ok((path, info))
}

fn read_u32(payload: &[u8], at: usize) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .get(at..at + 4)
        .ok_or(Error::FrameTooLarge(0))?
        .try_into()
        .map_err(|_| Error::FrameTooLarge(0))?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(payload: &[u8], at: usize) -> Result<u64> {
    let bytes: [u8; 8] = payload
        .get(at..at + 8)
        .ok_or(Error::FrameTooLarge(0))?
        .try_into()
        .map_err(|_| Error::FrameTooLarge(0))?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_file_dict() {
        let mut dict = FileDict::new();
        dict.insert(
            "a/b.txt".to_string(),
            FileInfo {
                mtime: 1,
                last_modified: 1,
                num_blocks: 3,
            },
        );
        let msg = Message::FileDict(dict.clone());
        let payload = msg.encode_payload().unwrap();
        let decoded = Message::decode(MessageType::FileDict, &payload).unwrap();
        match decoded {
            Message::FileDict(got) => assert_eq!(got, dict),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_block() {
        let msg = Message::Block {
            block_index: 7,
            path: "dir/file.bin".to_string(),
            data: vec![1, 2, 3, 4, 5],
        };
        let payload = msg.encode_payload().unwrap();
        let decoded = Message::decode(MessageType::Block, &payload).unwrap();
        match decoded {
            Message::Block {
                block_index,
                path,
                data,
            } => {
                assert_eq!(block_index, 7);
                assert_eq!(path, "dir/file.bin");
                assert_eq!(data, vec![1, 2, 3, 4, 5]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_block_request() {
        let msg = Message::BlockRequest {
            block_index: 2,
            path: "a.txt".to_string(),
        };
        let payload = msg.encode_payload().unwrap();
        let decoded = Message::decode(MessageType::BlockRequest, &payload).unwrap();
        match decoded {
            Message::BlockRequest { block_index, path } => {
                assert_eq!(block_index, 2);
                assert_eq!(path, "a.txt");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn encryption_flag_round_trips() {
        let msg = Message::Encryption { enabled: true };
        let payload = msg.encode_payload().unwrap();
        let decoded = Message::decode(MessageType::Encryption, &payload).unwrap();
        match decoded {
            Message::Encryption { enabled } => assert!(enabled),
            _ => panic!("wrong variant"),
        }
    }
}
