use protocol::{ErrorKind, Gossip, Request, RoutingHeader};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use storage::TupleStoreRegistry;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn, Instrument};

use crate::connection::{CallOptions, Shared};
use crate::state::ConnectionState;
use crate::ChannelError;

/// Supplies tuples to piggy-back on keep-alives.
pub trait GossipSource: Send + Sync {
    fn gossip(&self) -> Option<Gossip>;
}

impl GossipSource for TupleStoreRegistry {
    fn gossip(&self) -> Option<Gossip> {
        let (table, tuple) = self.sample()?;
        Some(Gossip {
            table,
            tuples: vec![tuple],
        })
    }
}

/// Periodic batch flush and idle keep-alive.
pub(crate) async fn run(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.maintenance_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut state = shared.subscribe_state();

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = state.changed() => {
                if changed.is_err() || state.borrow().is_terminal() {
                    return;
                }
                continue;
            }
        }

        shared.writer.request_flush();

        if shared.state() == ConnectionState::Running
            && shared.writer.idle_time() >= shared.config.keep_alive_interval()
            && !shared.keep_alive_in_flight.swap(true, Ordering::SeqCst)
        {
            tokio::spawn(keep_alive(shared.clone()).in_current_span());
        }
    }
}

async fn keep_alive(shared: Arc<Shared>) {
    let gossip = shared.gossip.as_ref().and_then(|source| source.gossip());
    let request = Request::KeepAlive {
        gossip: gossip.clone(),
    };
    // Keep-alives are never retried
    match shared
        .call_once(&request, RoutingHeader::direct(), CallOptions::default())
        .await
    {
        Ok(_) => trace!("Keep-alive acknowledged"),
        Err(ChannelError::Remote {
            kind: ErrorKind::OutdatedTuples,
            ..
        }) => {
            if let Some(gossip) = gossip {
                repair(&shared, gossip).await;
            }
        }
        Err(e) => debug!("Keep-alive failed: {e}"),
    }
    shared.keep_alive_in_flight.store(false, Ordering::SeqCst);
}

/// Re-inserts our copy of tuples the peer reported as outdated. Failures are
/// only logged.
async fn repair(shared: &Shared, gossip: Gossip) {
    for tuple in gossip.tuples {
        let key = tuple.key.clone();
        let request = Request::InsertTuple {
            table: gossip.table.clone(),
            tuple,
        };
        match shared
            .call_once(&request, RoutingHeader::direct(), CallOptions::default())
            .await
        {
            Ok(_) => debug!(table = %gossip.table, key, "Repaired outdated tuple"),
            Err(e) => warn!(table = %gossip.table, key, "Gossip repair failed: {e}"),
        }
    }
}
