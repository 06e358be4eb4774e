//! Launch environment helpers.
//!
//! An external launcher starts one process per rank and tells each process
//! who it is through environment variables. [`LaunchInfo`] collects those
//! values and turns them into a connected [`Group`].
//!
//! # Environment Variables
//!
//! | Setting | Variables (first one set wins) | Description |
//! |---------|--------------------------------|-------------|
//! | rank | `FERROLINK_RANK`, `SLURM_PROCID`, `PMI_RANK`, `OMPI_COMM_WORLD_RANK` | Rank of this process |
//! | size | `FERROLINK_SIZE`, `SLURM_NTASKS`, `PMI_SIZE`, `OMPI_COMM_WORLD_SIZE` | Group size (defaults to the peer count) |
//! | peers | `FERROLINK_PEERS` | Comma-separated `host:port`, one per rank, in rank order |
//! | connect timeout | `FERROLINK_CONNECT_TIMEOUT_MS` | Bootstrap deadline |
//! | receive timeout | `FERROLINK_RECV_TIMEOUT_MS` | Per-receive bound, `0` waits forever |
//! | verification | `FERROLINK_VERIFY_COLLECTIVES` | `1`/`0`, `true`/`false`, `on`/`off` |

use crate::error::{Error, Result};
use crate::group::{Group, GroupConfig};
use crate::transport::tcp::{TcpConfig, TcpTransport};
use crate::Rank;
use std::env;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

/// Variables holding this process's rank, in priority order.
pub const RANK_VARS: &[&str] = &[
    "FERROLINK_RANK",
    "SLURM_PROCID",
    "PMI_RANK",
    "OMPI_COMM_WORLD_RANK",
];

/// Variables holding the group size, in priority order.
pub const SIZE_VARS: &[&str] = &[
    "FERROLINK_SIZE",
    "SLURM_NTASKS",
    "PMI_SIZE",
    "OMPI_COMM_WORLD_SIZE",
];

/// Variable holding the peer address list.
pub const PEERS_VAR: &str = "FERROLINK_PEERS";

const CONNECT_TIMEOUT_VAR: &str = "FERROLINK_CONNECT_TIMEOUT_MS";
const RECV_TIMEOUT_VAR: &str = "FERROLINK_RECV_TIMEOUT_MS";
const VERIFY_VAR: &str = "FERROLINK_VERIFY_COLLECTIVES";

/// Everything a process needs to join its group.
#[derive(Debug, Clone)]
pub struct LaunchInfo {
    /// Rank of this process.
    pub rank: Rank,
    /// Number of ranks.
    pub size: usize,
    /// Listening address of every rank, in rank order.
    pub peers: Vec<SocketAddr>,
    /// Transport options.
    pub tcp: TcpConfig,
    /// Group options.
    pub group: GroupConfig,
}

impl LaunchInfo {
    /// Read the launch environment of this process.
    ///
    /// Returns `Ok(None)` when no peer list is set (not started by a
    /// launcher), and [`Error::InvalidConfiguration`] when values are present
    /// but malformed or inconsistent.
    pub fn detect() -> Result<Option<Self>> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`detect`](Self::detect), but a missing peer list is an error.
    pub fn from_env() -> Result<Self> {
        Self::detect()?.ok_or_else(|| Error::config(format!("{PEERS_VAR} is not set")))
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(peer_list) = lookup(PEERS_VAR) else {
            return Ok(None);
        };
        let peers = parse_peers(&peer_list)?;

        let size = first_parsed::<usize, _>(&lookup, SIZE_VARS)?.unwrap_or(peers.len());
        if size != peers.len() {
            return Err(Error::config(format!(
                "group size is {size} but {PEERS_VAR} lists {} addresses",
                peers.len()
            )));
        }
        let rank = first_parsed::<Rank, _>(&lookup, RANK_VARS)?.ok_or_else(|| {
            Error::config(format!("no rank found in any of {}", RANK_VARS.join(", ")))
        })?;
        if rank >= size {
            return Err(Error::config(format!(
                "rank {rank} is outside a group of size {size}"
            )));
        }

        let mut tcp = TcpConfig::default();
        if let Some(ms) = parse_var::<u64, _>(&lookup, CONNECT_TIMEOUT_VAR)? {
            tcp.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, RECV_TIMEOUT_VAR)? {
            tcp.recv_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        let mut group = GroupConfig::default();
        if let Some(raw) = lookup(VERIFY_VAR) {
            group.verify_collectives = parse_flag(VERIFY_VAR, &raw)?;
        }

        Ok(Some(LaunchInfo {
            rank,
            size,
            peers,
            tcp,
            group,
        }))
    }

    /// Connect the TCP mesh and build the group.
    pub fn connect(&self) -> Result<Group<TcpTransport>> {
        let transport = TcpTransport::connect(self.rank, &self.peers, &self.tcp)?;
        Group::with_config(self.rank, self.size, transport, self.group.clone())
    }
}

fn parse_peers(list: &str) -> Result<Vec<SocketAddr>> {
    let peers = list
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.to_socket_addrs()
                .map_err(|e| Error::config(format!("cannot resolve peer '{p}': {e}")))?
                .next()
                .ok_or_else(|| Error::config(format!("peer '{p}' resolved to no address")))
        })
        .collect::<Result<Vec<_>>>()?;
    if peers.is_empty() {
        return Err(Error::config(format!("{PEERS_VAR} lists no peers")));
    }
    Ok(peers)
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::config(format!("{key}='{raw}' is not a valid number")))
        })
        .transpose()
}

fn first_parsed<T, F>(lookup: &F, keys: &[&str]) -> Result<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    for key in keys {
        if let Some(value) = parse_var(lookup, key)? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key}='{raw}' is not a boolean"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn absent_peer_list_means_not_launched() {
        let info = LaunchInfo::from_lookup(lookup(&[("FERROLINK_RANK", "0")])).unwrap();
        assert!(info.is_none());
    }

    #[test]
    fn full_environment() {
        let info = LaunchInfo::from_lookup(lookup(&[
            ("FERROLINK_PEERS", "127.0.0.1:7000, 127.0.0.1:7001,127.0.0.1:7002"),
            ("FERROLINK_RANK", "2"),
            ("FERROLINK_CONNECT_TIMEOUT_MS", "1500"),
            ("FERROLINK_RECV_TIMEOUT_MS", "250"),
            ("FERROLINK_VERIFY_COLLECTIVES", "on"),
        ]))
        .unwrap()
        .unwrap();

        assert_eq!(info.rank, 2);
        assert_eq!(info.size, 3);
        assert_eq!(info.peers[1].port(), 7001);
        assert_eq!(info.tcp.connect_timeout, Duration::from_millis(1500));
        assert_eq!(info.tcp.recv_timeout, Some(Duration::from_millis(250)));
        assert!(info.group.verify_collectives);
    }

    #[test]
    fn scheduler_variables_are_fallbacks() {
        let info = LaunchInfo::from_lookup(lookup(&[
            ("FERROLINK_PEERS", "127.0.0.1:7000,127.0.0.1:7001"),
            ("SLURM_PROCID", "1"),
            ("SLURM_NTASKS", "2"),
            ("PMI_RANK", "0"),
            ("FERROLINK_RECV_TIMEOUT_MS", "0"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(info.rank, 1);
        assert_eq!(info.tcp.recv_timeout, None);
    }

    #[test]
    fn inconsistent_values_are_configuration_errors() {
        let cases: &[&[(&str, &str)]] = &[
            // size disagrees with peer count
            &[
                ("FERROLINK_PEERS", "127.0.0.1:7000"),
                ("FERROLINK_SIZE", "2"),
                ("FERROLINK_RANK", "0"),
            ],
            // rank out of range
            &[("FERROLINK_PEERS", "127.0.0.1:7000"), ("FERROLINK_RANK", "1")],
            // no rank at all
            &[("FERROLINK_PEERS", "127.0.0.1:7000")],
            // not a number
            &[("FERROLINK_PEERS", "127.0.0.1:7000"), ("FERROLINK_RANK", "zero")],
            // empty list
            &[("FERROLINK_PEERS", " , "), ("FERROLINK_RANK", "0")],
            // bad flag
            &[
                ("FERROLINK_PEERS", "127.0.0.1:7000"),
                ("FERROLINK_RANK", "0"),
                ("FERROLINK_VERIFY_COLLECTIVES", "maybe"),
            ],
        ];
        for vars in cases {
            let err = LaunchInfo::from_lookup(lookup(vars)).unwrap_err();
            assert!(err.is_configuration(), "{vars:?}: {err}");
        }
    }
}
