use futures_util::StreamExt;
use model::query::{QueryId, QueryPlan};
use model::{Hyperrectangle, RegionId, TableName};
use protocol::{
    compression, Capabilities, ErrorKind, Frame, FrameCodec, FrameWriter, Hello, PackageType,
    Request, Response, RoutingHeader, WriterHandle, PROTOCOL_VERSION,
};
use query::{ClientQuery, ContinuousQuery, PageOutcome, SnapshotQuery};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, instrument, trace, warn, Instrument};

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::pool::PageWorkerPool;
use crate::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Disconnect,
}

/// A query of this connection, keyed by the sequence it was registered
/// under.
#[derive(Clone)]
struct ActiveQuery {
    /// Set for continuous queries.
    id: Option<QueryId>,
    query: Arc<dyn ClientQuery>,
}

struct Connection {
    peer: String,
    context: Arc<ServerContext>,
    config: ServerConfig,
    writer: WriterHandle,
    queries: Mutex<HashMap<u16, ActiveQuery>>,
    pool: PageWorkerPool,
}

/// Serves one client connection until it disconnects, fails or violates
/// the protocol. The first frame must be a hello.
#[instrument(skip_all, fields(peer = %peer))]
pub async fn serve_connection<S>(
    stream: S,
    peer: String,
    context: Arc<ServerContext>,
    config: ServerConfig,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (writer, frame_writer) = FrameWriter::new(write_half, &config.writer);
    let writer_task = tokio::spawn(frame_writer.run().in_current_span());
    let mut frames = FramedRead::new(read_half, FrameCodec::default());

    let result = run(&mut frames, &writer, peer, context, config).await;

    match &result {
        Ok(()) => info!("Connection closed"),
        Err(e) => warn!("Closing connection: {e}"),
    }
    if writer.close().await.is_err() {
        debug!("Writer was already closed");
    }
    drop(writer);
    match writer_task.await {
        Ok(Err(e)) => debug!("Writer stopped with: {e}"),
        Err(e) => debug!("Writer task failed: {e}"),
        Ok(Ok(())) => {}
    }
    result
}

async fn run<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    writer: &WriterHandle,
    peer: String,
    context: Arc<ServerContext>,
    config: ServerConfig,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
{
    handshake(frames, writer, &config).await?;
    info!("Connection established");

    let connection = Arc::new(Connection {
        peer,
        context,
        writer: writer.clone(),
        queries: Mutex::new(HashMap::new()),
        pool: PageWorkerPool::new(config.max_active_queries),
        config,
    });
    let maintenance = tokio::spawn(maintain(Arc::downgrade(&connection)).in_current_span());
    let outcome = connection.read_loop(frames).await;
    maintenance.abort();
    connection.shutdown().await;
    outcome
}

async fn handshake<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    writer: &WriterHandle,
    config: &ServerConfig,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
{
    let frame = match tokio::time::timeout(config.handshake_timeout(), frames.next()).await {
        Err(_) => return Err(ServerError::Handshake("no hello received in time".to_string())),
        Ok(None) => {
            return Err(ServerError::Handshake("connection closed before hello".to_string()))
        }
        Ok(Some(frame)) => frame?,
    };
    let hello = match Request::from_frame(&frame) {
        Ok(Request::Hello(hello)) => hello,
        Ok(other) => {
            return Err(ServerError::Handshake(format!(
                "expected a hello, got {}",
                other.package_type()
            )))
        }
        Err(e) => return Err(ServerError::Handshake(e.to_string())),
    };
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(ServerError::Handshake(format!(
            "protocol version {} is not supported",
            hello.protocol_version
        )));
    }

    let ours = Hello {
        protocol_version: PROTOCOL_VERSION,
        capabilities: Capabilities { gzip: config.gzip },
    };
    writer
        .send_urgent(Response::Hello(ours).to_frame(frame.sequence)?)
        .await?;
    if config.gzip && hello.capabilities.gzip {
        debug!("Enabling compression");
        writer.enable_compression().await?;
    }
    Ok(())
}

/// Flushes batched frames and lets parked page fetches re-check their flush
/// deadline.
async fn maintain(connection: Weak<Connection>) {
    let Some(period) = connection.upgrade().map(|c| c.config.maintenance_interval()) else {
        return;
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(connection) = connection.upgrade() else {
            return;
        };
        connection.writer.request_flush();
        for active in connection.active_queries() {
            active.query.wake();
        }
    }
}

impl Connection {
    async fn read_loop<R>(
        self: &Arc<Self>,
        frames: &mut FramedRead<R, FrameCodec>,
    ) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin,
    {
        while let Some(frame) = frames.next().await {
            if self.handle_frame(frame?).await? == Flow::Disconnect {
                return Ok(());
            }
        }
        debug!("Peer closed the connection");
        Ok(())
    }

    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<Flow, ServerError> {
        let frames = match frame.kind()? {
            PackageType::Compression => compression::unpack(&frame)?,
            _ => vec![frame],
        };
        for frame in frames {
            // Undecodable requests end the connection
            let request = Request::from_frame(&frame)?;
            trace!(sequence = frame.sequence, kind = %request.package_type(), "Received request");
            if self.dispatch(frame.sequence, frame.routing, request).await? == Flow::Disconnect {
                return Ok(Flow::Disconnect);
            }
        }
        Ok(Flow::Continue)
    }

    /// Application errors are answered with error frames. Only a failing
    /// writer ends the connection from here.
    async fn dispatch(
        self: &Arc<Self>,
        sequence: u16,
        routing: RoutingHeader,
        request: Request,
    ) -> Result<Flow, ServerError> {
        match request {
            Request::Hello(_) => {
                self.reply(
                    sequence,
                    Response::error(ErrorKind::UnsupportedRequest, "Handshake already completed"),
                )
                .await?;
            }
            Request::Disconnect => {
                info!("Peer disconnects");
                self.writer
                    .send_urgent(Response::Success.to_frame(sequence)?)
                    .await?;
                return Ok(Flow::Disconnect);
            }
            Request::InsertTuple { table, tuple } => {
                let response = if routing.is_noop() {
                    Response::Success
                } else {
                    match self.context.insert(&table, tuple, &routing) {
                        Ok(_) => Response::Success,
                        Err(e) => e.to_response(),
                    }
                };
                self.reply(sequence, response).await?;
            }
            Request::ContinuousQuery { plan, regions } => {
                self.register(sequence, plan, regions).await?
            }
            Request::RangeQuery {
                table,
                range,
                page_size,
            } => self.range_query(sequence, table, range, page_size).await?,
            Request::NextPage { query_sequence } => self.next_page(sequence, query_sequence).await?,
            Request::CancelQuery { query_sequence } => {
                self.cancel(query_sequence);
                self.reply(sequence, Response::Success).await?;
            }
            Request::KeepAlive { gossip } => {
                let outdated = gossip
                    .map(|gossip| self.context.outdated_keys(&gossip))
                    .unwrap_or_default();
                let response = if outdated.is_empty() {
                    Response::Success
                } else {
                    debug!(keys = outdated.len(), "Gossip revealed outdated tuples");
                    Response::error(ErrorKind::OutdatedTuples, outdated.join(","))
                };
                self.reply(sequence, response).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply(&self, sequence: u16, response: Response) -> Result<(), ServerError> {
        self.writer.send(response.to_frame(sequence)?).await?;
        Ok(())
    }

    /// Registration is acknowledged with an empty page so that errors reach
    /// the client right away. Results follow on next-page requests.
    #[instrument(skip_all, fields(sequence = sequence, query = %plan.id))]
    async fn register(
        self: &Arc<Self>,
        sequence: u16,
        plan: QueryPlan,
        regions: Vec<RegionId>,
    ) -> Result<(), ServerError> {
        match self.start_continuous(sequence, plan, regions) {
            Ok(()) => {
                self.reply(sequence, Response::MultipleTupleStart).await?;
                self.reply(sequence, Response::PageEnd).await?;
                self.writer.flush().await?;
                Ok(())
            }
            Err(e) => {
                debug!("Rejected continuous query: {e}");
                self.reply(sequence, e.to_response()).await
            }
        }
    }

    fn start_continuous(
        &self,
        sequence: u16,
        plan: QueryPlan,
        regions: Vec<RegionId>,
    ) -> Result<(), ServerError> {
        let table = plan.stream_table.clone();
        let regions = if regions.is_empty() {
            self.context.local_regions(&table, &plan.query_range)?
        } else {
            self.context.partitioner(&table)?;
            regions
        };

        let mut queries = self.lock_queries();
        self.check_capacity(&queries, sequence, Some(plan.id))?;
        let stores = regions
            .iter()
            .map(|region| self.context.storage.get_or_create(&table.local(*region)))
            .collect();
        let processor_context = self.context.processor_context();
        let query = ContinuousQuery::start(plan, stores, &processor_context, &self.config.query);
        queries.insert(
            sequence,
            ActiveQuery {
                id: Some(query.id()),
                query,
            },
        );
        Ok(())
    }

    #[instrument(skip_all, fields(sequence = sequence, table = %table))]
    async fn range_query(
        self: &Arc<Self>,
        sequence: u16,
        table: TableName,
        range: Hyperrectangle,
        page_size: u32,
    ) -> Result<(), ServerError> {
        match self.start_snapshot(sequence, &table, &range, page_size) {
            Ok(query) => self.submit_page(sequence, sequence, query).await,
            Err(e) => self.reply(sequence, e.to_response()).await,
        }
    }

    fn start_snapshot(
        &self,
        sequence: u16,
        table: &TableName,
        range: &Hyperrectangle,
        page_size: u32,
    ) -> Result<Arc<dyn ClientQuery>, ServerError> {
        self.context.partitioner(table)?;
        let page_size = match page_size {
            0 => self.config.query.snapshot_page_size,
            n => n,
        };
        let mut queries = self.lock_queries();
        self.check_capacity(&queries, sequence, None)?;
        let query: Arc<dyn ClientQuery> =
            Arc::new(SnapshotQuery::start(&self.context.storage, table, range, page_size));
        queries.insert(
            sequence,
            ActiveQuery {
                id: None,
                query: query.clone(),
            },
        );
        Ok(query)
    }

    async fn next_page(
        self: &Arc<Self>,
        sequence: u16,
        query_sequence: u16,
    ) -> Result<(), ServerError> {
        let active = self.lock_queries().get(&query_sequence).cloned();
        match active {
            Some(active) => self.submit_page(query_sequence, sequence, active.query).await,
            None => {
                let message = format!("No query under sequence {query_sequence}");
                self.reply(sequence, Response::error(ErrorKind::QueryNotFound, message)).await
            }
        }
    }

    /// Streams the next page of `query` under `page_sequence` on the worker
    /// pool. A finished query is forgotten.
    async fn submit_page(
        self: &Arc<Self>,
        query_sequence: u16,
        page_sequence: u16,
        query: Arc<dyn ClientQuery>,
    ) -> Result<(), ServerError> {
        let connection = self.clone();
        let job = async move {
            match query.fetch_next_page(page_sequence, &connection.writer).await {
                Ok(PageOutcome::Finished) => connection.forget(query_sequence, &query),
                Ok(PageOutcome::More) => {}
                Err(e) => debug!(query_sequence, page_sequence, "Failed to stream page: {e}"),
            }
        };
        if self.pool.submit(job).is_err() {
            self.reply(
                page_sequence,
                Response::error(ErrorKind::ShuttingDown, "Connection is shutting down"),
            )
            .await?;
        }
        Ok(())
    }

    fn cancel(&self, query_sequence: u16) {
        let removed = self.lock_queries().remove(&query_sequence);
        match removed {
            Some(active) => {
                active.query.close();
                debug!(query_sequence, "Cancelled query");
            }
            None => debug!(query_sequence, "Cancel of unknown query"),
        }
    }

    fn forget(&self, query_sequence: u16, query: &Arc<dyn ClientQuery>) {
        let mut queries = self.lock_queries();
        let same = queries
            .get(&query_sequence)
            .is_some_and(|active| Arc::ptr_eq(&active.query, query));
        if same {
            queries.remove(&query_sequence);
        }
    }

    fn check_capacity(
        &self,
        queries: &HashMap<u16, ActiveQuery>,
        sequence: u16,
        id: Option<QueryId>,
    ) -> Result<(), ServerError> {
        if queries.contains_key(&sequence) {
            return Err(ServerError::DuplicateQuery(format!("sequence {sequence}")));
        }
        if let Some(id) = id {
            if queries.values().any(|active| active.id == Some(id)) {
                return Err(ServerError::DuplicateQuery(format!("query id {id}")));
            }
        }
        if queries.len() >= self.config.max_active_queries {
            return Err(ServerError::TooManyQueries(queries.len()));
        }
        Ok(())
    }

    fn active_queries(&self) -> Vec<ActiveQuery> {
        self.lock_queries().values().cloned().collect()
    }

    /// Ends every query and waits for running page fetches.
    async fn shutdown(&self) {
        let queries = self.lock_queries().drain().map(|(_, active)| active).collect::<Vec<_>>();
        debug!(peer = %self.peer, queries = queries.len(), "Closing queries");
        for active in &queries {
            active.query.close();
        }
        self.pool.shutdown(self.config.shutdown_grace()).await;
    }

    fn lock_queries(&self) -> MutexGuard<'_, HashMap<u16, ActiveQuery>> {
        self.queries
            .lock()
            .expect("No one should panic while holding this lock")
    }
}
