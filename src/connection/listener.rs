//! The Listener: accepts inbound TCP connections for the process's
//! lifetime, per §4.4.

use tokio::net::TcpListener;

use crate::connection::HubHandle;
use crate::error::Result;
use crate::PORT;

pub async fn run(hub: HubHandle) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", PORT)).await?;
    log::info!("listening on port {}", PORT);
    loop {
        let (socket, addr) = listener.accept().await?;
        let ip = match addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => {
                log::warn!("rejecting IPv6 connection from {}", addr);
                continue;
            }
        };
        log::info!("accepted connection from {}", ip);
        if let Err(e) = hub.accept(ip, socket).await {
            log::warn!("failed to install inbox for {}: {}", ip, e);
        }
    }
}
