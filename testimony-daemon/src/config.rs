//! Configuration Record (§3): loaded once at startup, immutable thereafter.

use std::path::PathBuf;

use serde::Deserialize;

use testimony_ring::{FilterInstruction, FilterProgram, RingConfig};
use testimony_wire::tpacket3::FanoutKind;
use testimony_wire::{RingErrorKind, RingGeometry, RingResult};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "socket")]
    pub sockets: Vec<SocketConfig>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&text)?;
        Ok(cfg)
    }
}

/// One `[[socket]]` table: a filesystem socket path, the interface it
/// multiplexes, and the ring geometry every shard of its Fanout Group
/// shares (§3's "for a given socket path all derived rings share
/// identical geometry").
#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    pub path: PathBuf,
    pub interface: String,
    pub block_size: u32,
    pub block_count: u32,
    #[serde(default = "default_block_timeout_ms")]
    pub block_timeout_ms: u32,
    #[serde(default = "default_fanout_id")]
    pub fanout_id: u16,
    #[serde(default = "default_fanout_size")]
    pub fanout_size: u32,
    #[serde(default = "default_fanout_kind")]
    pub fanout_kind: String,
    #[serde(default)]
    pub filter: Option<Vec<FilterInstructionConfig>>,
    /// Unix permission bits applied to the control socket right after
    /// `bind`, per spec.md's access-control model: the path's owner/group
    /// and this mode are what govern who may connect. `None` leaves the
    /// socket at whatever the process umask produces.
    #[serde(default)]
    pub mode: Option<u32>,
}

fn default_block_timeout_ms() -> u32 {
    100
}

fn default_fanout_id() -> u16 {
    1
}

fn default_fanout_size() -> u32 {
    1
}

fn default_fanout_kind() -> String {
    "hash".to_owned()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterInstructionConfig {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SocketConfig {
    pub fn geometry(&self) -> RingGeometry {
        RingGeometry {
            fanout_size: self.fanout_size,
            block_size: self.block_size,
            block_count: self.block_count,
        }
    }

    /// Builds the per-shard [`RingConfig`] the Ring Provider opens for
    /// fanout member `fanout_id` of this socket's group.
    pub fn ring_config(&self, fanout_id: u16) -> RingResult<RingConfig> {
        let fanout_kind = FanoutKind::parse(&self.fanout_kind).ok_or_else(|| {
            RingErrorKind::UnsupportedFanoutKind(self.fanout_kind.clone())
        })?;
        let filter = self.filter.as_ref().map(|instructions| {
            FilterProgram::new(
                instructions
                    .iter()
                    .map(|i| FilterInstruction {
                        code: i.code,
                        jt: i.jt,
                        jf: i.jf,
                        k: i.k,
                    })
                    .collect(),
            )
        });
        Ok(RingConfig {
            if_name: self.interface.clone(),
            block_size: self.block_size,
            block_count: self.block_count,
            block_timeout_ms: self.block_timeout_ms,
            fanout_id,
            fanout_size: self.fanout_size,
            fanout_kind,
            filter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_socket_table() {
        let toml = r#"
            [[socket]]
            path = "/run/testimony/eth0.sock"
            interface = "eth0"
            block_size = 65536
            block_count = 8
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.sockets.len(), 1);
        let s = &cfg.sockets[0];
        assert_eq!(s.fanout_size, 1);
        assert_eq!(s.fanout_kind, "hash");
        assert_eq!(s.block_timeout_ms, 100);
        assert_eq!(s.mode, None);
    }

    #[test]
    fn parses_configured_mode() {
        let toml = r#"
            [[socket]]
            path = "/run/testimony/eth0.sock"
            interface = "eth0"
            block_size = 65536
            block_count = 8
            mode = 0o660
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.sockets[0].mode, Some(0o660));
    }

    #[test]
    fn rejects_unknown_fanout_kind() {
        let s = SocketConfig {
            path: "/tmp/x.sock".into(),
            interface: "eth0".into(),
            block_size: 65536,
            block_count: 4,
            block_timeout_ms: 100,
            fanout_id: 1,
            fanout_size: 1,
            fanout_kind: "round-robin-ish".into(),
            filter: None,
            mode: None,
        };
        assert!(matches!(
            s.ring_config(1),
            Err(RingErrorKind::UnsupportedFanoutKind(_))
        ));
    }
}
