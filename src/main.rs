//! CLI entry point: argument parsing, logging initialisation, and startup
//! error handling, per spec.md §6. Everything past a valid [`Conf`] is
//! handled by [`syncmesh::engine::run`].

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use syncmesh::conf::Conf;
use syncmesh::error::{Error, Result};

#[derive(Parser, Debug)]
#[clap(name = "syncmesh", about = "A peer-to-peer directory synchronization daemon")]
struct Cli {
    /// Comma-separated IPv4 addresses of peers to connect to on startup.
    #[clap(long, value_delimiter = ',')]
    ip: Vec<String>,

    /// Whether to enable AES-256-CBC frame encryption: "yes" or "no".
    #[clap(long, default_value = "no")]
    encryption: String,

    /// Directory whose contents are shared with peers. Defaults to `./share`.
    #[clap(long)]
    share_dir: Option<PathBuf>,

    /// Directory holding persisted state and in-progress downloads.
    /// Defaults to `./temp`.
    #[clap(long)]
    temp_dir: Option<PathBuf>,
}

fn parse_peers(raw: &[String]) -> Result<Vec<Ipv4Addr>> {
    raw.iter().map(|s| parse_ipv4(s)).collect()
}

/// Parses a dotted-decimal IPv4 address, rejecting anything that isn't
/// exactly four octets each in `[0, 255]`, per §6.
fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    let octets: Vec<&str> = s.split('.').collect();
    if octets.len() != 4 {
        return Err(Error::InvalidPeerAddress(s.to_string()));
    }
    let mut parsed = [0u8; 4];
    for (i, octet) in octets.iter().enumerate() {
        let n: i64 = octet
            .parse()
            .map_err(|_| Error::InvalidPeerAddress(s.to_string()))?;
        if !(0..=255).contains(&n) {
            return Err(Error::InvalidPeerAddress(s.to_string()));
        }
        parsed[i] = n as u8;
    }
    Ok(Ipv4Addr::from(parsed))
}

fn parse_encryption(raw: &str) -> Result<bool> {
    match raw {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(Error::InvalidEncryptionFlag(other.to_string())),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let peers = parse_peers(&cli.ip).unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1);
    });
    let encryption = parse_encryption(&cli.encryption).unwrap_or_else(|e| {
        eprintln!("{}", e);
        process::exit(1);
    });

    log::info!("peers: {:?}", peers);
    log::info!("encryption: {}", encryption);

    let mut conf = Conf::new(peers);
    conf.engine.encryption = encryption;
    if let Some(share_dir) = cli.share_dir {
        conf.paths.share_dir = share_dir;
    }
    if let Some(temp_dir) = cli.temp_dir {
        conf.paths.temp_dir = temp_dir;
    }

    if let Err(e) = syncmesh::engine::run(conf).await {
        log::error!("engine exited with error: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_dotted_quad() {
        assert_eq!(parse_ipv4("192.168.1.1").unwrap(), Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn rejects_wrong_octet_count() {
        assert!(parse_ipv4("1.2.3").is_err());
    }

    #[test]
    fn rejects_out_of_range_octet() {
        assert!(parse_ipv4("1.2.3.256").is_err());
    }

    #[test]
    fn rejects_non_numeric_octet() {
        assert!(parse_ipv4("a.b.c.d").is_err());
    }

    #[test]
    fn parses_multiple_peers() {
        let raw = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let peers = parse_peers(&raw).unwrap();
        assert_eq!(peers, vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)]);
    }

    #[test]
    fn encryption_flag_accepts_yes_no_only() {
        assert!(parse_encryption("yes").unwrap());
        assert!(!parse_encryption("no").unwrap());
        assert!(parse_encryption("maybe").is_err());
    }
}
