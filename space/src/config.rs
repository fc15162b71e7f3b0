//! Command-line surface and startup configuration for the space server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use parsec_shared::{ServerId, SpaceDuration, SpaceId};
use thiserror::Error;

use crate::oseg::OsegConfig;
use crate::server::ServerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Server id 0 is reserved")]
    NullServerId,
    #[error("Invalid space id '{value}'")]
    BadSpaceId { value: String },
    #[error("Unknown oseg backend '{spec}'; this build ships 'local'")]
    UnknownOsegBackend { spec: String },
    #[error("Cannot read layout file {path}: {source}")]
    LayoutUnreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Layout line {line} is malformed: '{content}'")]
    LayoutMalformed { line: usize, content: String },
    #[error("Layout does not mention this server ({server})")]
    LayoutMissingSelf { server: ServerId },
    #[error("Malformed --peer '{value}', expected <server-id>=<addr:port>")]
    BadPeer { value: String },
}

/// One row of the layout file: which axis-aligned region a server owns.
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutEntry {
    pub server: ServerId,
    pub min: [f32; 3],
    pub max: [f32; 3],
}

/// The space-server command line.
#[derive(Parser, Debug)]
#[command(name = "parsec-space", about = "A parsec space server node")]
pub struct SpaceOpts {
    /// This node's server id (nonzero).
    #[arg(long)]
    pub server_id: u32,

    /// Space id, 32 hex characters. Defaults to the zero space.
    #[arg(long)]
    pub space: Option<String>,

    /// Region-to-server assignment file: one
    /// `<server-id> <min-x> <min-y> <min-z> <max-x> <max-y> <max-z>`
    /// per line; `#` comments.
    #[arg(long)]
    pub layout: Option<PathBuf>,

    /// Object directory backend.
    #[arg(long, default_value = "local")]
    pub oseg: String,

    /// Host of a networked oseg backend (accepted for forward
    /// compatibility; 'local' ignores it).
    #[arg(long)]
    pub oseg_host: Option<String>,

    #[arg(long, default_value_t = 6379)]
    pub oseg_port: u16,

    /// Key namespace prefix in the backing store.
    #[arg(long, default_value = "")]
    pub oseg_prefix: String,

    /// Per-peer capacity hint, bytes per second.
    #[arg(long, default_value_t = 10_000_000)]
    pub capacity: u64,

    /// Worker threads for the strand pool.
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Main loop tick, milliseconds.
    #[arg(long, default_value_t = 50)]
    pub tick_ms: u64,

    /// UDP address for inter-server (OHDP) traffic.
    #[arg(long, default_value = "0.0.0.0:7770")]
    pub listen_server: SocketAddr,

    /// UDP address for object-host (ODP) traffic.
    #[arg(long, default_value = "0.0.0.0:7771")]
    pub listen_object: SocketAddr,

    /// Peer address, `<server-id>=<addr:port>`; repeatable.
    #[arg(long = "peer")]
    pub peers: Vec<String>,
}

/// Validated startup configuration.
#[derive(Debug)]
pub struct SpaceConfig {
    pub server_id: ServerId,
    pub space: SpaceId,
    pub layout: Vec<LayoutEntry>,
    pub peers: Vec<ServerId>,
    pub peer_addrs: HashMap<ServerId, SocketAddr>,
    pub server: ServerConfig,
    pub workers: usize,
    pub tick: SpaceDuration,
    pub listen_server: SocketAddr,
    pub listen_object: SocketAddr,
    pub oseg_backend: String,
}

impl SpaceConfig {
    pub fn from_opts(opts: SpaceOpts) -> Result<Self, ConfigError> {
        if opts.server_id == 0 {
            return Err(ConfigError::NullServerId);
        }
        let server_id = ServerId(opts.server_id);

        let space = match &opts.space {
            None => SpaceId::ZERO,
            Some(value) => {
                SpaceId::from_hex(value).map_err(|_| ConfigError::BadSpaceId {
                    value: value.clone(),
                })?
            }
        };

        if opts.oseg != "local" {
            return Err(ConfigError::UnknownOsegBackend {
                spec: opts.oseg.clone(),
            });
        }

        let layout = match &opts.layout {
            None => Vec::new(),
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::LayoutUnreadable {
                        path: path.clone(),
                        source,
                    })?;
                let layout = parse_layout(&content)?;
                if !layout.iter().any(|entry| entry.server == server_id) {
                    return Err(ConfigError::LayoutMissingSelf { server: server_id });
                }
                layout
            }
        };

        let mut peer_addrs = HashMap::new();
        for raw in &opts.peers {
            let (id, addr) = raw
                .split_once('=')
                .ok_or_else(|| ConfigError::BadPeer { value: raw.clone() })?;
            let id: u32 = id.parse().map_err(|_| ConfigError::BadPeer { value: raw.clone() })?;
            let addr: SocketAddr = addr
                .parse()
                .map_err(|_| ConfigError::BadPeer { value: raw.clone() })?;
            peer_addrs.insert(ServerId(id), addr);
        }

        let mut peers: Vec<ServerId> = layout
            .iter()
            .map(|entry| entry.server)
            .filter(|server| *server != server_id)
            .chain(peer_addrs.keys().copied())
            .collect();
        peers.sort();
        peers.dedup();

        let mut server = ServerConfig::default();
        server.oseg = OsegConfig {
            prefix: opts.oseg_prefix.clone(),
            ..OsegConfig::default()
        };
        server.receiver.capacity = opts.capacity as f64;
        // the per-tick transmit budget follows the capacity hint
        server.tick_budget_bytes =
            ((opts.capacity as u128 * opts.tick_ms as u128) / 1000).max(1024) as usize;

        Ok(Self {
            server_id,
            space,
            layout,
            peers,
            peer_addrs,
            server,
            workers: opts.workers.max(1),
            tick: SpaceDuration::from_millis(opts.tick_ms.max(1) as i64),
            listen_server: opts.listen_server,
            listen_object: opts.listen_object,
            oseg_backend: opts.oseg,
        })
    }
}

fn parse_layout(content: &str) -> Result<Vec<LayoutEntry>, ConfigError> {
    let mut entries = Vec::new();
    for (index, raw_line) in content.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let malformed = || ConfigError::LayoutMalformed {
            line: index + 1,
            content: raw_line.to_string(),
        };
        if fields.len() != 7 {
            return Err(malformed());
        }
        let server: u32 = fields[0].parse().map_err(|_| malformed())?;
        if server == 0 {
            return Err(malformed());
        }
        let mut bounds = [0.0f32; 6];
        for (slot, field) in bounds.iter_mut().zip(&fields[1..]) {
            *slot = field.parse().map_err(|_| malformed())?;
        }
        entries.push(LayoutEntry {
            server: ServerId(server),
            min: [bounds[0], bounds[1], bounds[2]],
            max: [bounds[3], bounds[4], bounds[5]],
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(args: &[&str]) -> SpaceOpts {
        let mut full = vec!["parsec-space"];
        full.extend_from_slice(args);
        SpaceOpts::parse_from(full)
    }

    #[test]
    fn minimal_options_validate() {
        let config = SpaceConfig::from_opts(opts(&["--server-id", "1"])).unwrap();
        assert_eq!(config.server_id, ServerId(1));
        assert_eq!(config.space, SpaceId::ZERO);
        assert!(config.peers.is_empty());
    }

    #[test]
    fn server_id_zero_is_rejected() {
        let error = SpaceConfig::from_opts(opts(&["--server-id", "0"])).unwrap_err();
        assert!(matches!(error, ConfigError::NullServerId));
    }

    #[test]
    fn unknown_backend_is_fatal() {
        let error =
            SpaceConfig::from_opts(opts(&["--server-id", "1", "--oseg", "redis"])).unwrap_err();
        assert!(matches!(error, ConfigError::UnknownOsegBackend { .. }));
    }

    #[test]
    fn peers_parse_and_dedup() {
        let config = SpaceConfig::from_opts(opts(&[
            "--server-id",
            "1",
            "--peer",
            "2=127.0.0.1:7780",
            "--peer",
            "3=127.0.0.1:7790",
        ]))
        .unwrap();
        assert_eq!(config.peers, vec![ServerId(2), ServerId(3)]);
        assert_eq!(
            config.peer_addrs[&ServerId(2)],
            "127.0.0.1:7780".parse().unwrap()
        );
    }

    #[test]
    fn malformed_peer_is_rejected() {
        let error =
            SpaceConfig::from_opts(opts(&["--server-id", "1", "--peer", "nonsense"])).unwrap_err();
        assert!(matches!(error, ConfigError::BadPeer { .. }));
    }

    #[test]
    fn layout_parses_regions_and_comments() {
        let layout = parse_layout(
            "# region map\n1 -100 -100 -100 0 100 100\n2 0 -100 -100 100 100 100\n",
        )
        .unwrap();
        assert_eq!(layout.len(), 2);
        assert_eq!(layout[0].server, ServerId(1));
        assert_eq!(layout[1].min, [0.0, -100.0, -100.0]);
    }

    #[test]
    fn malformed_layout_line_is_rejected() {
        let error = parse_layout("1 2 3\n").unwrap_err();
        assert!(matches!(error, ConfigError::LayoutMalformed { line: 1, .. }));
    }

    #[test]
    fn capacity_scales_the_tick_budget() {
        let config = SpaceConfig::from_opts(opts(&[
            "--server-id",
            "1",
            "--capacity",
            "1000000",
            "--tick-ms",
            "100",
        ]))
        .unwrap();
        assert_eq!(config.server.tick_budget_bytes, 100_000);
    }
}
