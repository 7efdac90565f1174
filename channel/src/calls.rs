use model::MultiTuple;
use protocol::{Hello, Response};
use std::collections::{HashMap, HashSet};
use tokio::sync::{oneshot, OwnedSemaphorePermit};
use tracing::warn;

use crate::sequence::SequenceNumberGenerator;
use crate::ChannelError;

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success,
    Hello(Hello),
    Page(Page),
    /// The request was routed to zero hops and never sent.
    Skipped,
}

/// Results received between a multiple-tuple-start and a page end.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub results: Vec<MultiTuple>,
    /// Set by multiple-tuple-end: the query behind this page is finished.
    pub complete: bool,
}

/// A continuous query registered on the peer under `query_sequence`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRegistration {
    pub query_sequence: u16,
    pub first_page: Page,
}

pub(crate) type ReplySender = oneshot::Sender<Result<Reply, ChannelError>>;

pub(crate) struct PendingCall {
    results: Vec<MultiTuple>,
    reply: ReplySender,
    _permit: OwnedSemaphorePermit,
}

/// Pending calls and the sequence numbers they occupy. Both live behind the
/// same lock so that failure handling clears them together.
#[derive(Default)]
pub(crate) struct CallTable {
    sequences: SequenceNumberGenerator,
    calls: HashMap<u16, PendingCall>,
    /// Sequences that stay allocated after their call completed because the
    /// peer keys a live query by them.
    held: HashSet<u16>,
}

impl CallTable {
    pub fn register(
        &mut self,
        reply: ReplySender,
        permit: OwnedSemaphorePermit,
        hold: bool,
    ) -> Result<u16, (ReplySender, ChannelError)> {
        let Some(sequence) = self.sequences.acquire() else {
            return Err((reply, ChannelError::SequencesExhausted));
        };
        if hold {
            self.held.insert(sequence);
        }
        self.calls.insert(
            sequence,
            PendingCall {
                results: Vec::new(),
                reply,
                _permit: permit,
            },
        );
        Ok(sequence)
    }

    /// Applies one response frame. Returns true if it completed a call.
    pub fn apply(&mut self, sequence: u16, response: Response) -> bool {
        let Some(call) = self.calls.get_mut(&sequence) else {
            warn!(sequence, kind = %response.package_type(), "Response without pending call");
            return false;
        };
        let outcome = match response {
            Response::Tuple { table, tuple } => {
                call.results.push(MultiTuple::single(table, tuple));
                return false;
            }
            Response::JoinedTuple(result) => {
                call.results.push(result);
                return false;
            }
            Response::MultipleTupleStart => return false,
            Response::PageEnd => Ok(Reply::Page(Page {
                results: std::mem::take(&mut call.results),
                complete: false,
            })),
            Response::MultipleTupleEnd => Ok(Reply::Page(Page {
                results: std::mem::take(&mut call.results),
                complete: true,
            })),
            Response::Success => Ok(Reply::Success),
            Response::Hello(hello) => Ok(Reply::Hello(hello)),
            Response::Error { kind, message } => Err(ChannelError::Remote { kind, message }),
        };
        self.complete(sequence, outcome);
        true
    }

    pub fn complete(&mut self, sequence: u16, outcome: Result<Reply, ChannelError>) {
        if let Some(call) = self.calls.remove(&sequence) {
            if !self.held.contains(&sequence) {
                self.sequences.release(sequence);
            }
            // The caller may have given up waiting
            let _ = call.reply.send(outcome);
        }
    }

    pub fn release_held(&mut self, sequence: u16) {
        if self.held.remove(&sequence) && !self.calls.contains_key(&sequence) {
            self.sequences.release(sequence);
        }
    }

    /// Fails every pending call and forgets all sequence numbers.
    pub fn fail_all(&mut self, error: &ChannelError) -> usize {
        let failed = self.calls.len();
        for (_, call) in self.calls.drain() {
            let _ = call.reply.send(Err(error.clone()));
        }
        self.held.clear();
        self.sequences.clear();
        failed
    }

    pub fn pending(&self) -> usize {
        self.calls.len()
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    pub fn is_pending(&self, sequence: u16) -> bool {
        self.calls.contains_key(&sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{Hyperrectangle, TableName, Tuple};
    use std::sync::Arc;
    use tokio::sync::Semaphore;

    fn permit(semaphore: &Arc<Semaphore>) -> OwnedSemaphorePermit {
        semaphore.clone().try_acquire_owned().unwrap()
    }

    #[tokio::test]
    async fn collects_tuples_until_page_end() {
        let semaphore = Arc::new(Semaphore::new(4));
        let mut table = CallTable::default();
        let (tx, rx) = oneshot::channel();
        let seq = table.register(tx, permit(&semaphore), false).ok().unwrap();

        let tuple = Tuple::new("a", Hyperrectangle::full_space(), "", 1);
        assert!(!table.apply(seq, Response::MultipleTupleStart));
        assert!(!table.apply(seq, Response::Tuple { table: TableName::new("osm", "cars"), tuple }));
        assert!(table.apply(seq, Response::PageEnd));

        let Ok(Reply::Page(page)) = rx.await.unwrap() else {
            panic!("expected a page");
        };
        assert_eq!(page.results.len(), 1);
        assert!(!page.complete);
        assert_eq!(semaphore.available_permits(), 4, "completing a call frees its slot");
    }

    #[tokio::test]
    async fn held_sequences_survive_completion() {
        let semaphore = Arc::new(Semaphore::new(4));
        let mut table = CallTable::default();
        let (tx, _rx) = oneshot::channel();
        let seq = table.register(tx, permit(&semaphore), true).ok().unwrap();
        table.apply(seq, Response::MultipleTupleEnd);

        assert_eq!(table.pending(), 0);
        assert!(table.sequences.is_used(seq));
        table.release_held(seq);
        assert!(!table.sequences.is_used(seq));
    }

    #[tokio::test]
    async fn fail_all_clears_everything() {
        let semaphore = Arc::new(Semaphore::new(4));
        let mut table = CallTable::default();
        let mut receivers = Vec::new();
        for hold in [false, true] {
            let (tx, rx) = oneshot::channel();
            table.register(tx, permit(&semaphore), hold).ok().unwrap();
            receivers.push(rx);
        }

        let error = ChannelError::ConnectionLost {
            peer: "peer".into(),
            reason: "reset".into(),
        };
        assert_eq!(table.fail_all(&error), 2);
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(ChannelError::ConnectionLost { .. })));
        }
        assert_eq!(table.sequences.used(), 0);
        assert_eq!(table.held(), 0);
    }
}
