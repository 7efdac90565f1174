use async_trait::async_trait;
use channel::{ChannelConfig, ChannelError, ConnectionState, GossipSource, SequencedChannel};
use model::NodeAddr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::link::{NodeConnector, QueryLink};
use crate::ClientError;

/// One running channel per node, connected on first use.
///
/// Channels that stopped or failed are replaced on the next lookup.
pub struct ConnectionPool {
    config: ChannelConfig,
    gossip: Option<Arc<dyn GossipSource>>,
    channels: Mutex<HashMap<NodeAddr, SequencedChannel>>,
}

impl ConnectionPool {
    pub fn new(config: ChannelConfig, gossip: Option<Arc<dyn GossipSource>>) -> Self {
        Self {
            config,
            gossip,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, node: &NodeAddr) -> Result<SequencedChannel, ChannelError> {
        if let Some(channel) = self.cached(node) {
            return Ok(channel);
        }

        let channel =
            SequencedChannel::connect(node, self.config.clone(), self.gossip.clone()).await?;
        let raced = {
            let mut channels = self.lock();
            match channels.get(node) {
                Some(existing) if existing.state() == ConnectionState::Running => {
                    Some(existing.clone())
                }
                _ => {
                    channels.insert(node.clone(), channel.clone());
                    None
                }
            }
        };
        match raced {
            Some(existing) => {
                debug!(node = %node, "Lost connect race, keeping the existing channel");
                channel.disconnect().await;
                Ok(existing)
            }
            None => {
                info!(node = %node, "Connected");
                Ok(channel)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnects every pooled channel.
    pub async fn close_all(&self) {
        let channels = self.lock().drain().map(|(_, channel)| channel).collect::<Vec<_>>();
        for channel in channels {
            channel.disconnect().await;
        }
    }

    fn cached(&self, node: &NodeAddr) -> Option<SequencedChannel> {
        let mut channels = self.lock();
        match channels.get(node) {
            Some(channel) if channel.state() == ConnectionState::Running => Some(channel.clone()),
            Some(channel) => {
                debug!(node = %node, state = %channel.state(), "Dropping unusable channel");
                channels.remove(node);
                None
            }
            None => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeAddr, SequencedChannel>> {
        self.channels
            .lock()
            .expect("No one should panic while holding this lock")
    }
}

#[async_trait]
impl NodeConnector for ConnectionPool {
    async fn link(&self, node: &NodeAddr) -> Result<Arc<dyn QueryLink>, ClientError> {
        let channel = self.get(node).await?;
        Ok(Arc::new(channel) as Arc<dyn QueryLink>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_nodes_are_not_cached() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let node = NodeAddr::from(listener.local_addr().unwrap());
        drop(listener);

        let pool = ConnectionPool::new(ChannelConfig::default(), None);
        assert!(matches!(pool.get(&node).await, Err(ChannelError::Connect { .. })));
        assert!(pool.is_empty());
    }
}
