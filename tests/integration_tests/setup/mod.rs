use anyhow::Result;
use geostream::model::{
    DistributionGroup, DistributionRegion, Hyperrectangle, NodeAddr, RegionId, TableName, Tuple,
};
use geostream::{Node, NodeConfig};
use std::time::Duration;

pub const RESULT_TIMEOUT: Duration = Duration::from_secs(5);
/// Long enough for several flush windows to pass.
pub const QUIET_PERIOD: Duration = Duration::from_millis(600);

pub fn rect(coords: &[f64]) -> Hyperrectangle {
    Hyperrectangle::from_coordinates(coords).unwrap()
}

pub fn cars() -> TableName {
    TableName::new("osm", "cars")
}

pub fn roads() -> TableName {
    TableName::new("osm", "roads")
}

pub fn tuple(key: &str, coords: &[f64]) -> Tuple {
    Tuple::new(key, rect(coords), "", 1)
}

pub fn region(id: u64, covering_box: Hyperrectangle, owner: &NodeAddr) -> DistributionRegion {
    DistributionRegion {
        group: DistributionGroup::new("osm"),
        id: RegionId(id),
        covering_box,
        systems: vec![owner.clone()],
    }
}

fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.bind = "127.0.0.1:0".to_string();
    config.query.continuous_flush_ms = 50;
    config.server.maintenance_interval_ms = 20;
    config.channel.maintenance_interval_ms = 20;
    config
}

/// Nodes on loopback that all know the `cars` and `roads` tables and learn
/// about every announced region.
pub struct Cluster {
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub async fn start(nodes: usize) -> Result<Self> {
        test_utils::init_tracing();
        let mut started = Vec::with_capacity(nodes);
        for _ in 0..nodes {
            let node = Node::start(node_config()).await?;
            node.create_table(&cars());
            node.create_table(&roads());
            started.push(node);
        }
        Ok(Self { nodes: started })
    }

    /// A cluster of one node owning the whole space of `osm`.
    pub async fn single() -> Result<Self> {
        let cluster = Self::start(1).await?;
        let owner = cluster.node(0).local_node().clone();
        cluster.announce(region(1, Hyperrectangle::full_space(), &owner));
        Ok(cluster)
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    /// Owners learn about a region first so that subscriptions opened in
    /// reaction to it find it there.
    pub fn announce(&self, region: DistributionRegion) {
        let (owners, others): (Vec<&Node>, Vec<&Node>) = self
            .nodes
            .iter()
            .partition(|node| region.systems.contains(node.local_node()));
        for node in owners.into_iter().chain(others) {
            node.put_region(region.clone());
        }
    }

    pub async fn shutdown(self) -> Result<()> {
        for node in self.nodes {
            node.shutdown().await?;
        }
        Ok(())
    }
}

/// Polls `condition` until it holds or `RESULT_TIMEOUT` passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + RESULT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
