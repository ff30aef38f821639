// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

mod block;
pub mod conf;
pub mod connection;
pub mod download;
pub mod engine;
pub mod error;
pub mod file_center;
pub mod gate;
pub mod wire;

pub use block::{block_count, BLOCK_SIZE};
pub use wire::FileInfo;

/// The fixed TCP port every peer listens on.
///
/// The protocol has no port negotiation or discovery step, so this is a
/// well-known constant rather than something discovered at runtime.
pub const PORT: u16 = 23456;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_is_stable() {
        assert_eq!(PORT, 23456);
    }
}
