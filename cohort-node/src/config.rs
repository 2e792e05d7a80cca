use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::NodeError;

/// The role of the member accepting writes.
pub const LEADER_ROLE: &str = "leader";

#[derive(Debug, Clone)]
/// Configuration for the cluster network.
pub struct ConnectionConfig {
    /// The binding address for the transport to bind and listen on.
    ///
    /// This is often `0.0.0.0` + your chosen port.
    pub listen_addr: SocketAddr,

    /// The public address to be broadcast to other cluster members.
    ///
    /// This is normally the machine's public IP address and the port the server is listening on.
    pub public_addr: SocketAddr,

    /// The initial members the node contacts in order to join the cluster.
    ///
    /// A node whose only seed is its own public address bootstraps a new cluster
    /// rather than joining an existing one.
    pub seed_nodes: Vec<SocketAddr>,
}

impl ConnectionConfig {
    /// Creates a new connection config.
    pub fn new(
        listen_addr: SocketAddr,
        public_addr: SocketAddr,
        seeds: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        Self {
            listen_addr,
            public_addr,
            seed_nodes: seeds.into_iter().collect(),
        }
    }

    /// Returns if the node should bootstrap a new cluster.
    pub fn is_bootstrap(&self) -> bool {
        !self.seed_nodes.is_empty()
            && self.seed_nodes.iter().all(|seed| *seed == self.public_addr)
    }

    /// Checks the config can be used to start a node.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.seed_nodes.is_empty() {
            return Err(NodeError::InvalidSetting(
                "at least one seed is required; list the node's own address to bootstrap"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Timing and policy settings of the membership protocol.
pub struct MembershipSettings {
    /// How often a member sends heartbeats to every other member.
    pub heartbeat_interval: Duration,
    /// How long without a heartbeat until a member is suspected.
    pub heartbeat_timeout: Duration,
    /// How long a suspicion must persist before the member's failure is proposed.
    pub fail_threshold: Duration,
    /// How long an agreement round may wait for its quorum.
    pub round_timeout: Duration,
    /// How often a joining member re-sends its join request.
    pub join_retry_interval: Duration,
    /// The upper bound of the backoff applied after abandoned rounds.
    pub max_backoff: Duration,
    /// The roles which are kept elected at all times.
    pub elected_roles: Vec<String>,
    /// The capacity of the node's inbound queues.
    pub inbound_queue_capacity: usize,
}

impl Default for MembershipSettings {
    fn default() -> Self {
        if cfg!(test) {
            Self {
                heartbeat_interval: Duration::from_millis(200),
                heartbeat_timeout: Duration::from_millis(600),
                fail_threshold: Duration::from_secs(1),
                round_timeout: Duration::from_millis(500),
                join_retry_interval: Duration::from_millis(250),
                max_backoff: Duration::from_secs(2),
                elected_roles: vec![LEADER_ROLE.to_string()],
                inbound_queue_capacity: 1000,
            }
        } else {
            Self {
                heartbeat_interval: Duration::from_secs(1),
                heartbeat_timeout: Duration::from_secs(3),
                fail_threshold: Duration::from_secs(5),
                round_timeout: Duration::from_secs(2),
                join_retry_interval: Duration::from_secs(1),
                max_backoff: Duration::from_secs(30),
                elected_roles: vec![LEADER_ROLE.to_string()],
                inbound_queue_capacity: 1000,
            }
        }
    }
}

impl MembershipSettings {
    /// Checks the settings are consistent with one another.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.heartbeat_interval.is_zero() {
            return Err(invalid("heartbeat_interval must be greater than zero"));
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(invalid(
                "heartbeat_timeout must be greater than heartbeat_interval",
            ));
        }

        if self.round_timeout.is_zero() {
            return Err(invalid("round_timeout must be greater than zero"));
        }

        if self.join_retry_interval.is_zero() {
            return Err(invalid("join_retry_interval must be greater than zero"));
        }

        if self.inbound_queue_capacity == 0 {
            return Err(invalid("inbound_queue_capacity must be greater than zero"));
        }

        if self.elected_roles.is_empty() {
            return Err(invalid("at least one elected role is required"));
        }

        let mut seen = BTreeSet::new();
        for role in self.elected_roles.iter() {
            if role.is_empty() {
                return Err(invalid("elected roles must not be empty strings"));
            }

            if !seen.insert(role.as_str()) {
                return Err(NodeError::InvalidSetting(format!(
                    "the elected role {role:?} is listed more than once"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> NodeError {
    NodeError::InvalidSetting(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_seed_list_is_rejected() {
        let addr = test_helper::get_unused_addr();
        let cfg = ConnectionConfig::new(addr, addr, Vec::new());

        let err = cfg.validate().expect_err("Empty seed list should be rejected.");
        assert!(err.to_string().contains("list the node's own address to bootstrap"));
    }

    #[test]
    fn test_bootstrap_detection() {
        let addr: SocketAddr = ([127, 0, 0, 1], 7000).into();
        let other: SocketAddr = ([127, 0, 0, 1], 7001).into();

        assert!(ConnectionConfig::new(addr, addr, [addr]).is_bootstrap());
        assert!(!ConnectionConfig::new(addr, addr, [addr, other]).is_bootstrap());
        assert!(!ConnectionConfig::new(addr, addr, [other]).is_bootstrap());
        assert!(!ConnectionConfig::new(addr, addr, Vec::new()).is_bootstrap());
    }

    #[test]
    fn test_settings_validation() {
        assert!(MembershipSettings::default().validate().is_ok());

        let settings = MembershipSettings {
            heartbeat_timeout: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = MembershipSettings {
            round_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = MembershipSettings {
            elected_roles: Vec::new(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());

        let settings = MembershipSettings {
            elected_roles: vec![LEADER_ROLE.to_string(), LEADER_ROLE.to_string()],
            ..Default::default()
        };
        let err = settings.validate().expect_err("Duplicate roles should be rejected.");
        assert!(err.to_string().contains("leader"));
    }
}
