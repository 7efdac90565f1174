//! Shared helpers for tests across the workspace: a runtime for property
//! tests and a scripted protocol peer over an in-memory duplex stream.

use futures_util::{SinkExt, StreamExt};
use protocol::{
    compression, Capabilities, Frame, FrameCodec, Hello, PackageType, Request, Response,
    RoutingHeader,
};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::runtime::Runtime;
use tokio_util::codec::Framed;

pub use proptest;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

pub fn get_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("Could not create tokio runtime")
    })
}

/// Runs an async property body on the shared runtime. Returns false if the
/// body panicked so it can be used with `prop_assert!`.
pub fn test_prop<F, Fut>(test_fn: F) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        get_runtime().block_on(test_fn())
    }))
    .is_ok()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const DUPLEX_BUFFER: usize = 256 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted end of a protocol connection. Compression envelopes are
/// unpacked transparently so tests only see the frames inside.
pub struct FramePeer {
    frames: Framed<DuplexStream, FrameCodec>,
    unpacked: VecDeque<Frame>,
}

impl FramePeer {
    /// Returns the stream for the code under test and the scripted peer.
    pub fn pair() -> (DuplexStream, FramePeer) {
        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
        let peer = FramePeer {
            frames: Framed::new(theirs, FrameCodec::default()),
            unpacked: VecDeque::new(),
        };
        (ours, peer)
    }

    /// Next frame, or None once the other side closed the stream.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.unpacked.pop_front() {
                return Some(frame);
            }
            let frame = tokio::time::timeout(RECV_TIMEOUT, self.frames.next())
                .await
                .expect("Timed out waiting for a frame")?
                .expect("Received an undecodable frame");
            if matches!(frame.kind(), Ok(PackageType::Compression)) {
                self.unpacked
                    .extend(compression::unpack(&frame).expect("Received a broken envelope"));
                continue;
            }
            return Some(frame);
        }
    }

    pub async fn next_request(&mut self) -> Option<(u16, Request)> {
        let frame = self.next_frame().await?;
        let request = Request::from_frame(&frame).expect("Expected a request frame");
        Some((frame.sequence, request))
    }

    pub async fn next_response(&mut self) -> Option<(u16, Response)> {
        let frame = self.next_frame().await?;
        let response = Response::from_frame(&frame).expect("Expected a response frame");
        Some((frame.sequence, response))
    }

    pub async fn send_frame(&mut self, frame: Frame) {
        self.frames.send(frame).await.expect("Could not write frame");
    }

    pub async fn reply(&mut self, sequence: u16, response: Response) {
        let frame = response.to_frame(sequence).expect("Could not encode response");
        self.send_frame(frame).await;
    }

    pub async fn request(&mut self, sequence: u16, request: Request) {
        let frame = request
            .to_frame(sequence, RoutingHeader::direct())
            .expect("Could not encode request");
        self.send_frame(frame).await;
    }

    /// Plays the server side of the handshake.
    pub async fn accept_hello(&mut self, gzip: bool) {
        let (sequence, request) = self.next_request().await.expect("Channel closed before hello");
        assert!(matches!(request, Request::Hello(_)), "Expected hello, got {request:?}");
        self.reply(sequence, Response::Hello(hello(gzip))).await;
    }

    /// Plays the client side of the handshake.
    pub async fn say_hello(&mut self, gzip: bool) -> Hello {
        self.request(0, Request::Hello(hello(gzip))).await;
        match self.next_response().await {
            Some((_, Response::Hello(hello))) => hello,
            other => panic!("Expected hello response, got {other:?}"),
        }
    }

    /// Drives a multi-frame page answer to `sequence`.
    pub async fn reply_page(&mut self, sequence: u16, results: Vec<Response>, complete: bool) {
        self.reply(sequence, Response::MultipleTupleStart).await;
        for result in results {
            self.reply(sequence, result).await;
        }
        let end = if complete {
            Response::MultipleTupleEnd
        } else {
            Response::PageEnd
        };
        self.reply(sequence, end).await;
    }

    /// Reads responses to `sequence` up to the end of the page. Returns the
    /// results and whether the query finished.
    pub async fn read_page(&mut self, sequence: u16) -> (Vec<Response>, bool) {
        let mut results = Vec::new();
        loop {
            let (seq, response) = self.next_response().await.expect("Stream ended inside a page");
            assert_eq!(seq, sequence, "Interleaved response {response:?}");
            match response {
                Response::MultipleTupleStart => {}
                Response::PageEnd => return (results, false),
                Response::MultipleTupleEnd => return (results, true),
                Response::Tuple { .. } | Response::JoinedTuple(_) => results.push(response),
                other => panic!("Unexpected response inside a page: {other:?}"),
            }
        }
    }

    pub async fn close(self) {
        drop(self.frames);
    }
}

pub fn hello(gzip: bool) -> Hello {
    Hello {
        protocol_version: protocol::PROTOCOL_VERSION,
        capabilities: Capabilities { gzip },
    }
}
