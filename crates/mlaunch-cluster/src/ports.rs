//! Deterministic port assignment.
//!
//! Ports come from one counter starting at the base port. In a sharded
//! cluster the first router takes the base port, followed by every shard
//! member (shards in creation order, members in creation order), then the
//! config servers, then any additional routers. Non-sharded clusters number
//! their members from the base port.

use crate::topology::{Layout, TopologySpec};
use crate::{Error, Result};

/// Ports for every process of a topology, grouped by role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortAssignment {
    /// Non-sharded members, in creation order.
    pub main: Vec<u16>,
    /// Members of each shard, shards in creation order.
    pub shards: Vec<Vec<u16>>,
    /// Config server members.
    pub config: Vec<u16>,
    /// Routers; the first is the cluster's front door.
    pub routers: Vec<u16>,
}

impl PortAssignment {
    /// Every port in the order it was handed out.
    pub fn allocation_order(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        ports.extend(self.main.iter().copied());
        ports.extend(self.routers.first().copied());
        ports.extend(self.shards.iter().flatten().copied());
        ports.extend(self.config.iter().copied());
        ports.extend(self.routers.iter().skip(1).copied());
        ports
    }
}

struct PortCounter {
    next: u32,
}

impl PortCounter {
    fn new(base: u16) -> Self {
        Self {
            next: u32::from(base),
        }
    }

    fn take(&mut self) -> Result<u16> {
        let port = u16::try_from(self.next).map_err(|_| {
            Error::PortConflict(format!("port {} is outside the port range", self.next))
        })?;
        self.next += 1;
        Ok(port)
    }

    fn take_n(&mut self, count: u32) -> Result<Vec<u16>> {
        (0..count).map(|_| self.take()).collect()
    }
}

/// Assigns a port to every process the topology describes.
pub fn allocate(spec: &TopologySpec) -> Result<PortAssignment> {
    let mut counter = PortCounter::new(spec.base_port);
    let mut ports = PortAssignment::default();

    match &spec.layout {
        Layout::Single => {
            ports.main.push(counter.take()?);
        }
        Layout::ReplicaSet { nodes, arbiter, .. } => {
            ports.main = counter.take_n(nodes + u32::from(*arbiter))?;
        }
        Layout::Sharded {
            shards,
            shape,
            config,
            routers,
        } => {
            ports.routers.push(counter.take()?);
            for _ in 0..*shards {
                ports.shards.push(counter.take_n(shape.member_count())?);
            }
            ports.config = counter.take_n(config.count)?;
            ports
                .routers
                .extend(counter.take_n(routers.saturating_sub(1))?);
        }
    }

    Ok(ports)
}
