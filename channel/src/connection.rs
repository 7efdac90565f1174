use futures_util::StreamExt;
use model::query::QueryPlan;
use model::{Hyperrectangle, MultiTuple, NodeAddr, RegionId, TableName, Tuple};
use protocol::{
    compression, Capabilities, Frame, FrameCodec, FrameWriter, Hello, PackageType, Request,
    Response, RoutingHeader, WriterHandle, PROTOCOL_VERSION,
};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio_retry2::{Retry, RetryError};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::calls::{CallTable, Page, QueryRegistration, Reply};
use crate::config::ChannelConfig;
use crate::maintenance::{self, GossipSource};
use crate::retry::RetryPolicy;
use crate::state::{ConnectionState, StateCell};
use crate::ChannelError;

const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CallOptions {
    /// Bypass batching.
    pub urgent: bool,
    /// Keep the sequence allocated after the call completed successfully.
    pub hold: bool,
}

/// Request/response channel to one peer.
///
/// Every call gets a sequence number that is unique among the calls in
/// flight. Responses are matched back by that number. At most
/// `max_in_flight_calls` calls are pending at any time; further callers wait.
#[derive(Clone)]
pub struct SequencedChannel {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) peer: String,
    pub(crate) config: ChannelConfig,
    state: StateCell,
    calls: Mutex<CallTable>,
    permits: Arc<Semaphore>,
    settled: Notify,
    pub(crate) writer: WriterHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) gossip: Option<Arc<dyn GossipSource>>,
    pub(crate) keep_alive_in_flight: AtomicBool,
}

impl SequencedChannel {
    pub async fn connect(
        addr: &NodeAddr,
        config: ChannelConfig,
        gossip: Option<Arc<dyn GossipSource>>,
    ) -> Result<Self, ChannelError> {
        let peer = addr.to_string();
        let connect_error = |reason: String| ChannelError::Connect {
            peer: peer.clone(),
            reason,
        };
        let stream = tokio::time::timeout(
            config.connect_timeout(),
            TcpStream::connect((addr.host.as_str(), addr.port)),
        )
        .await
        .map_err(|_| connect_error("timed out".to_string()))?
        .map_err(|e| connect_error(e.to_string()))?;
        stream.set_nodelay(true).map_err(|e| connect_error(e.to_string()))?;

        Self::from_stream(peer, stream, config, gossip).await
    }

    /// Runs the channel over an already established byte stream and performs
    /// the hello handshake.
    pub async fn from_stream<S>(
        peer: String,
        stream: S,
        config: ChannelConfig,
        gossip: Option<Arc<dyn GossipSource>>,
    ) -> Result<Self, ChannelError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, frame_writer) = FrameWriter::new(write_half, &config.writer);
        let shared = Arc::new(Shared {
            peer: peer.clone(),
            state: StateCell::new(peer.clone()),
            calls: Mutex::new(CallTable::default()),
            permits: Arc::new(Semaphore::new(config.max_in_flight_calls.max(1))),
            settled: Notify::new(),
            writer,
            tasks: Mutex::new(Vec::new()),
            gossip,
            keep_alive_in_flight: AtomicBool::new(false),
            config,
        });
        shared.state.transition(ConnectionState::Starting);

        let span = info_span!("channel", peer = %peer);
        let writer_task = {
            let shared = shared.clone();
            tokio::spawn(
                async move {
                    if let Err(e) = frame_writer.run().await {
                        shared.fail(shared.connection_lost(e.to_string()));
                    }
                }
                .instrument(span.clone()),
            )
        };
        shared.track(writer_task);
        let reader_task =
            tokio::spawn(read_loop(shared.clone(), read_half).instrument(span.clone()));
        shared.track(reader_task);

        let channel = SequencedChannel { shared };
        channel.handshake().await?;

        let maintenance_task =
            tokio::spawn(maintenance::run(channel.shared.clone()).instrument(span));
        channel.shared.track(maintenance_task);
        Ok(channel)
    }

    async fn handshake(&self) -> Result<(), ChannelError> {
        let hello = Hello {
            protocol_version: PROTOCOL_VERSION,
            capabilities: Capabilities {
                gzip: self.shared.config.gzip,
            },
        };
        let options = CallOptions {
            urgent: true,
            hold: false,
        };
        let outcome = match self
            .shared
            .call_once(&Request::Hello(hello), RoutingHeader::direct(), options)
            .await
        {
            Ok((_, Reply::Hello(peer))) if peer.protocol_version == PROTOCOL_VERSION => Ok(peer),
            Ok((_, Reply::Hello(peer))) => Err(ChannelError::Protocol(format!(
                "Peer speaks protocol version {}, expected {}",
                peer.protocol_version, PROTOCOL_VERSION
            ))),
            Ok((_, other)) => Err(ChannelError::Protocol(format!("Expected hello, got {other:?}"))),
            Err(e) => Err(e),
        };

        let peer_hello = match outcome {
            Ok(peer_hello) => peer_hello,
            Err(e) => {
                self.shared.fail(e.clone());
                return Err(e);
            }
        };
        if peer_hello.capabilities.gzip && self.shared.config.gzip {
            self.shared.writer.enable_compression().await?;
        }
        self.shared.state.transition(ConnectionState::Running);
        info!(peer = %self.shared.peer, gzip = peer_hello.capabilities.gzip, "Connected");
        Ok(())
    }

    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.lock_calls().pending()
    }

    /// Sequences kept for live continuous queries.
    pub fn held_sequences(&self) -> usize {
        self.shared.lock_calls().held()
    }

    /// Sends `request` and waits for its complete reply, re-sending it on
    /// retryable failures as `policy` allows.
    pub async fn send(
        &self,
        request: Request,
        routing: RoutingHeader,
        policy: RetryPolicy,
    ) -> Result<Reply, ChannelError> {
        self.ensure_running()?;
        if routing.is_noop() {
            return Ok(Reply::Skipped);
        }
        let strategy = policy.strategy(&self.shared.config.retry);
        Retry::spawn(strategy, || async {
            self.shared
                .call_once(&request, routing.clone(), CallOptions::default())
                .await
                .map(|(_, reply)| reply)
                .map_err(|e| {
                    if e.is_retryable() {
                        debug!(peer = %self.shared.peer, "Retrying call: {e}");
                        RetryError::transient(e)
                    } else {
                        RetryError::permanent(e)
                    }
                })
        })
        .await
    }

    pub async fn insert_tuple(
        &self,
        table: TableName,
        tuple: Tuple,
        routing: RoutingHeader,
    ) -> Result<(), ChannelError> {
        match self
            .send(Request::InsertTuple { table, tuple }, routing, RetryPolicy::Default)
            .await?
        {
            Reply::Success | Reply::Skipped => Ok(()),
            other => Err(ChannelError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Registers a continuous query with the peer and returns its first page.
    #[instrument(skip_all, fields(peer = %self.shared.peer, query = %plan.id))]
    pub async fn register_continuous_query(
        &self,
        plan: QueryPlan,
        regions: Vec<RegionId>,
    ) -> Result<QueryRegistration, ChannelError> {
        self.ensure_running()?;
        let request = Request::ContinuousQuery { plan, regions };
        let options = CallOptions {
            urgent: false,
            hold: true,
        };
        let (query_sequence, reply) = self
            .shared
            .call_once(&request, RoutingHeader::direct(), options)
            .await?;
        match reply {
            Reply::Page(first_page) => {
                if first_page.complete {
                    self.shared.lock_calls().release_held(query_sequence);
                }
                debug!(query_sequence, "Registered continuous query");
                Ok(QueryRegistration {
                    query_sequence,
                    first_page,
                })
            }
            other => {
                self.shared.lock_calls().release_held(query_sequence);
                Err(ChannelError::UnexpectedReply(format!("{other:?}")))
            }
        }
    }

    /// Pulls the next page of the query registered under `query_sequence`.
    pub async fn next_page(&self, query_sequence: u16) -> Result<Page, ChannelError> {
        let reply = self
            .send(
                Request::NextPage { query_sequence },
                RoutingHeader::direct(),
                RetryPolicy::NoRetry,
            )
            .await;
        match reply {
            Ok(Reply::Page(page)) => {
                if page.complete {
                    self.shared.lock_calls().release_held(query_sequence);
                }
                Ok(page)
            }
            Ok(other) => Err(ChannelError::UnexpectedReply(format!("{other:?}"))),
            Err(e) => Err(e),
        }
    }

    pub async fn cancel_query(&self, query_sequence: u16) -> Result<(), ChannelError> {
        let reply = self
            .send(
                Request::CancelQuery { query_sequence },
                RoutingHeader::direct(),
                RetryPolicy::Default,
            )
            .await;
        self.shared.lock_calls().release_held(query_sequence);
        match reply? {
            Reply::Success => Ok(()),
            other => Err(ChannelError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// One-shot range query, drained page by page.
    pub async fn range_query(
        &self,
        table: TableName,
        range: Hyperrectangle,
        page_size: u32,
    ) -> Result<Vec<MultiTuple>, ChannelError> {
        self.ensure_running()?;
        let request = Request::RangeQuery {
            table,
            range,
            page_size,
        };
        let options = CallOptions {
            urgent: false,
            hold: true,
        };
        let (query_sequence, reply) = self
            .shared
            .call_once(&request, RoutingHeader::direct(), options)
            .await?;
        let Reply::Page(mut page) = reply else {
            self.shared.lock_calls().release_held(query_sequence);
            return Err(ChannelError::UnexpectedReply(format!("{reply:?}")));
        };

        let mut results = std::mem::take(&mut page.results);
        while !page.complete {
            page = match self.next_page(query_sequence).await {
                Ok(page) => page,
                Err(e) => {
                    self.shared.lock_calls().release_held(query_sequence);
                    return Err(e);
                }
            };
            results.append(&mut page.results);
        }
        self.shared.lock_calls().release_held(query_sequence);
        Ok(results)
    }

    /// Sends a disconnect, waits for pending calls to settle and terminates.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        if !shared.state.transition(ConnectionState::Stopping) {
            return;
        }
        info!(peer = %shared.peer, "Disconnecting");

        let options = CallOptions {
            urgent: true,
            hold: false,
        };
        let settled = async {
            if let Err(e) = shared
                .call_once(&Request::Disconnect, RoutingHeader::direct(), options)
                .await
            {
                debug!(peer = %shared.peer, "Disconnect was not acknowledged: {e}");
            }
            shared.settle().await;
        };
        if tokio::time::timeout(shared.config.settle_timeout(), settled)
            .await
            .is_err()
        {
            warn!(
                peer = %shared.peer,
                pending = shared.lock_calls().pending(),
                "Pending calls did not settle"
            );
        }

        if shared.state.transition(ConnectionState::Terminated) {
            let _ = tokio::time::timeout(WRITER_SHUTDOWN_GRACE, shared.writer.close()).await;
            shared.cleanup(&shared.connection_lost("channel terminated".to_string()));
        }
    }

    fn ensure_running(&self) -> Result<(), ChannelError> {
        match self.shared.state.get() {
            ConnectionState::Running => Ok(()),
            _ => Err(self.shared.not_running()),
        }
    }
}

impl Shared {
    pub(crate) fn lock_calls(&self) -> MutexGuard<'_, CallTable> {
        self.calls
            .lock()
            .expect("No one should panic while holding this lock")
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) async fn call_once(
        &self,
        request: &Request,
        routing: RoutingHeader,
        options: CallOptions,
    ) -> Result<(u16, Reply), ChannelError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| self.not_running())?;

        let (tx, rx) = oneshot::channel();
        let sequence = {
            let mut calls = self.lock_calls();
            // Checked under the lock so a concurrent failure either sees this
            // call or this call sees the failure
            if self.state.get().is_terminal() {
                return Err(self.not_running());
            }
            calls.register(tx, permit, options.hold).map_err(|(_, e)| e)?
        };

        let sent = match request.to_frame(sequence, routing) {
            Ok(frame) if options.urgent => self.writer.send_urgent(frame).await,
            Ok(frame) => self.writer.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            let mut calls = self.lock_calls();
            calls.complete(sequence, Err(e.into()));
            calls.release_held(sequence);
        }

        let outcome = rx
            .await
            .unwrap_or_else(|_| Err(self.connection_lost("call abandoned".to_string())));
        match outcome {
            Ok(reply) => Ok((sequence, reply)),
            Err(e) => {
                if options.hold {
                    self.lock_calls().release_held(sequence);
                }
                Err(e)
            }
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<(), ChannelError> {
        let frames = match frame.kind()? {
            PackageType::Compression => compression::unpack(&frame)?,
            _ => vec![frame],
        };
        for frame in frames {
            let response = Response::from_frame(&frame)?;
            if self.lock_calls().apply(frame.sequence, response) {
                self.settled.notify_waiters();
            }
        }
        Ok(())
    }

    pub(crate) fn fail(&self, error: ChannelError) {
        let target = match self.state.get() {
            ConnectionState::Stopping => ConnectionState::Terminated,
            _ => ConnectionState::Failed,
        };
        if self.state.transition(target) {
            if target == ConnectionState::Failed {
                warn!(peer = %self.peer, "Channel failed: {error}");
            }
            self.cleanup(&error);
        }
    }

    fn cleanup(&self, error: &ChannelError) {
        let failed = self.lock_calls().fail_all(error);
        self.permits.close();
        self.settled.notify_waiters();
        debug!(peer = %self.peer, failed, "Released pending calls");
        for task in self
            .tasks
            .lock()
            .expect("No one should panic while holding this lock")
            .drain(..)
        {
            task.abort();
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if self.state.get().is_terminal() {
            task.abort();
            return;
        }
        self.tasks
            .lock()
            .expect("No one should panic while holding this lock")
            .push(task);
    }

    async fn settle(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.lock_calls().pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn not_running(&self) -> ChannelError {
        ChannelError::NotRunning {
            peer: self.peer.clone(),
            state: self.state.get(),
        }
    }

    fn connection_lost(&self, reason: String) -> ChannelError {
        ChannelError::ConnectionLost {
            peer: self.peer.clone(),
            reason,
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(shared: Arc<Shared>, reader: R) {
    let mut frames = FramedRead::new(reader, FrameCodec::default());
    loop {
        let error = match frames.next().await {
            Some(Ok(frame)) => match shared.dispatch(frame) {
                Ok(()) => continue,
                Err(e) => e,
            },
            Some(Err(e)) => shared.connection_lost(e.to_string()),
            None => shared.connection_lost("closed by peer".to_string()),
        };
        shared.fail(error);
        return;
    }
}
