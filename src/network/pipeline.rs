// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, trace, Instrument};

use super::{FrameReader, OnceClose, ReorderBuffer};
use crate::protocol::Codec;
use crate::request::{Handler, Request, Response};
use crate::service::{
    is_peer_gone, CancelScope, CloseCause, ConnectionHandle, PipelineState, ServerConfig,
};

/// How a pipeline ended.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub cause: CloseCause,
    /// Result of closing the socket through its once-close guard.
    pub close_result: io::Result<()>,
}

/// Runs one accepted socket: read stage -> processing stage -> reorder buffer -> write stage.
///
/// The read and write stages run concurrently inside [`ConnectionPipeline::run`],
/// the processing stage runs in its own task and dispatches one task per
/// request. All of them share the connection's [`CancelScope`]:
/// - the read stage stops on any cancellation and never reads another frame;
/// - the processing stage stops dispatching on any cancellation but always
///   waits for the handler tasks it already started;
/// - the write stage keeps flushing on graceful causes and gives up on
///   abortive ones.
///
/// The socket is closed as soon as the read and write stages are done, which
/// may be before the last handler task finishes on an abortive cause.
pub struct ConnectionPipeline<C, H> {
    handle: ConnectionHandle,
    socket: OnceClose<TcpStream>,
    codec: Arc<C>,
    handler: Arc<H>,
    config: Arc<ServerConfig>,
}

impl<C, H> ConnectionPipeline<C, H>
where
    C: Codec,
    H: Handler<Request = C::Request, Response = C::Response>,
{
    pub fn new(
        handle: ConnectionHandle,
        socket: OnceClose<TcpStream>,
        codec: Arc<C>,
        handler: Arc<H>,
        config: Arc<ServerConfig>,
    ) -> Self {
        ConnectionPipeline {
            handle,
            socket,
            codec,
            handler,
            config,
        }
    }

    #[tracing::instrument(
        name = "connection",
        level = "debug",
        skip_all,
        fields(id = self.handle.id(), peer = %self.handle.remote_addr())
    )]
    pub async fn run(mut self) -> PipelineOutcome {
        let capacity = self.config.channel_capacity();
        let (request_tx, request_rx) = mpsc::channel(capacity);
        let (response_tx, response_rx) = mpsc::channel(capacity);
        let scope = self.handle.scope().clone();

        let processing = tokio::spawn(
            process_stage(
                self.handler.clone(),
                request_rx,
                response_tx,
                scope.clone(),
                self.config.max_in_flight(),
            )
            .in_current_span(),
        );

        match self.socket.get_mut() {
            Some(stream) => {
                let (read_half, write_half) = stream.split();
                let reader = FrameReader::new(read_half, self.config.read_buffer_size());
                let writer = BufWriter::new(write_half);
                tokio::join!(
                    read_stage(
                        reader,
                        &*self.codec,
                        request_tx,
                        &self.handle,
                        self.config.conn_idle_timeout(),
                    ),
                    write_stage(writer, &*self.codec, response_rx, &scope),
                );
            }
            None => {
                scope.cancel(CloseCause::Internal("socket closed before start".into()));
                drop(request_tx);
                drop(response_rx);
            }
        }

        if self.handle.state() != PipelineState::IdleTimedOut {
            self.handle.set_state(PipelineState::Cancelling);
        }
        debug!("Closing connection {}", self.handle.remote_addr());
        let close_result = self.socket.close();
        if close_result.is_ok() {
            debug!("Closed connection {}", self.handle.remote_addr());
        }

        if let Err(e) = processing.await {
            scope.cancel(CloseCause::Internal(format!("processing stage failed: {}", e)));
        }
        self.handle.set_state(PipelineState::Closed);

        PipelineOutcome {
            cause: scope.cause().unwrap_or(CloseCause::PeerClosed),
            close_result,
        }
    }
}

async fn read_stage<C, R>(
    mut reader: FrameReader<R>,
    codec: &C,
    requests: mpsc::Sender<Request<C::Request>>,
    handle: &ConnectionHandle,
    idle_timeout: Duration,
) where
    C: Codec,
    R: AsyncRead + Unpin,
{
    let scope = handle.scope();
    let remote_addr = handle.remote_addr();
    let mut sequence: u64 = 0;
    loop {
        let read = tokio::select! {
            biased;
            _ = scope.stopped() => {
                debug!("read stage stopped after {} requests", sequence);
                return;
            }
            read = time::timeout(idle_timeout, reader.read_frame(codec)) => read,
        };

        let payload = match read {
            Err(_) => {
                debug!(
                    "connection {} idle for {:?}, closing",
                    remote_addr, idle_timeout
                );
                handle.set_state(PipelineState::IdleTimedOut);
                scope.cancel(CloseCause::IdleTimeout(idle_timeout));
                return;
            }
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => {
                debug!(
                    "No more data to read, connection {} is already closed",
                    remote_addr
                );
                return;
            }
            Ok(Err(e)) if e.is_connection_closed() => {
                debug!(
                    "connection {} is already closed, this error can be safely ignored: {}",
                    remote_addr, e
                );
                return;
            }
            Ok(Err(e)) => {
                debug!("Error reading request from {}: {}", remote_addr, e);
                scope.cancel(CloseCause::Decode(e.to_string()));
                return;
            }
        };

        let request = Request {
            sequence,
            remote_addr,
            payload,
        };
        sequence += 1;
        trace!("read request {}", request.sequence);

        tokio::select! {
            biased;
            _ = scope.stopped() => return,
            sent = requests.send(request) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

async fn process_stage<H: Handler>(
    handler: Arc<H>,
    mut requests: mpsc::Receiver<Request<H::Request>>,
    responses: mpsc::Sender<Response<H::Response>>,
    scope: CancelScope,
    max_in_flight: usize,
) {
    let mut in_flight: JoinSet<(u64, Option<Response<H::Response>>)> = JoinSet::new();
    let mut reorder = ReorderBuffer::new();
    let mut accepting = true;
    let mut writer_gone = false;

    loop {
        tokio::select! {
            biased;
            _ = scope.stopped(), if accepting => {
                accepting = false;
                requests.close();
            }
            Some(joined) = in_flight.join_next() => {
                let (sequence, response) = match joined {
                    Ok(completed) => completed,
                    Err(e) => {
                        error!("request task failed: {}", e);
                        scope.cancel(CloseCause::Internal(e.to_string()));
                        continue;
                    }
                };
                if let Err(e) = reorder.complete(sequence, response) {
                    error!("{}", e);
                    scope.cancel(CloseCause::Internal(e.to_string()));
                    continue;
                }
                for response in reorder.drain_ready() {
                    if writer_gone {
                        break;
                    }
                    if responses.send(response).await.is_err() {
                        // write stage gave up, keep draining the handlers
                        writer_gone = true;
                    }
                }
            }
            request = requests.recv(), if accepting && in_flight.len() < max_in_flight => {
                match request {
                    Some(request) => dispatch(&mut in_flight, &handler, request),
                    None => accepting = false,
                }
            }
            else => break,
        }
    }
    trace!(
        "processing stage done, next response slot {}",
        reorder.next_sequence()
    );
}

fn dispatch<H: Handler>(
    in_flight: &mut JoinSet<(u64, Option<Response<H::Response>>)>,
    handler: &Arc<H>,
    request: Request<H::Request>,
) {
    let sequence = request.sequence;
    let handler = handler.clone();
    in_flight.spawn(
        async move {
            // a panicking handler only loses its own response
            let invocation = tokio::spawn(async move { handler.handle(request).await }).await;
            let response = match invocation {
                Ok(Ok(payload)) => Some(Response { sequence, payload }),
                Ok(Err(e)) => {
                    error!("Error processing request {}: {}", sequence, e);
                    None
                }
                Err(e) => {
                    error!("handler panicked on request {}: {}", sequence, e);
                    None
                }
            };
            (sequence, response)
        }
        .in_current_span(),
    );
}

async fn write_stage<C, W>(
    mut writer: BufWriter<W>,
    codec: &C,
    mut responses: mpsc::Receiver<Response<C::Response>>,
    scope: &CancelScope,
) where
    C: Codec,
    W: AsyncWrite + Unpin,
{
    let mut frame = BytesMut::new();
    loop {
        let response = tokio::select! {
            biased;
            _ = scope.aborted() => return,
            response = responses.recv() => match response {
                Some(response) => response,
                None => return,
            },
        };

        frame.clear();
        if let Err(e) = codec.encode(&response.payload, &mut frame) {
            error!("Error encoding response {}: {}", response.sequence, e);
            scope.cancel(CloseCause::Internal(e.to_string()));
            return;
        }

        let written = tokio::select! {
            biased;
            _ = scope.aborted() => return,
            written = write_frame(&mut writer, &frame) => written,
        };
        match written {
            Ok(()) => {}
            Err(e) if is_peer_gone(e.kind()) => {
                debug!(
                    "peer went away before response {} was written: {}",
                    response.sequence, e
                );
                scope.cancel(CloseCause::PeerClosed);
                return;
            }
            Err(e) => {
                error!("Error writing response {}: {}", response.sequence, e);
                scope.cancel(CloseCause::Write(e.to_string()));
                return;
            }
        }
        trace!("wrote response {}", response.sequence);
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use bytes::{Buf, BufMut, Bytes};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::LengthPrefixedCodec;
    use crate::{AppError, AppResult};

    /// `"<delay ms>:<text>"` is echoed after the delay, `"fail"` errors, `"panic"` panics.
    struct ScriptedHandler;

    impl Handler for ScriptedHandler {
        type Request = Bytes;
        type Response = Bytes;

        async fn handle(&self, request: Request<Bytes>) -> AppResult<Bytes> {
            let text = String::from_utf8(request.payload.to_vec()).unwrap();
            match text.as_str() {
                "fail" => Err(AppError::Handler("scripted failure".into())),
                "panic" => panic!("scripted panic"),
                _ => {
                    let (delay, body) = text.split_once(':').unwrap();
                    time::sleep(Duration::from_millis(delay.parse().unwrap())).await;
                    Ok(Bytes::from(body.to_string()))
                }
            }
        }
    }

    async fn start_pipeline(
        idle: Duration,
    ) -> (TcpStream, ConnectionHandle, tokio::task::JoinHandle<PipelineOutcome>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (socket, remote_addr) = listener.accept().await.unwrap();

        let config = ServerConfig::new("127.0.0.1", 0, idle).unwrap();
        let handle = ConnectionHandle::new(1, remote_addr, CancelScope::new());
        let pipeline = ConnectionPipeline::new(
            handle.clone(),
            OnceClose::new(socket),
            Arc::new(LengthPrefixedCodec::new(1024)),
            Arc::new(ScriptedHandler),
            Arc::new(config),
        );
        (client, handle, tokio::spawn(pipeline.run()))
    }

    async fn send(client: &mut TcpStream, body: &str) {
        let mut frame = BytesMut::new();
        frame.put_i32(body.len() as i32);
        frame.put_slice(body.as_bytes());
        client.write_all(&frame).await.unwrap();
    }

    async fn recv(client: &mut TcpStream) -> Option<String> {
        let mut header = [0u8; 4];
        if client.read_exact(&mut header).await.is_err() {
            return None;
        }
        let len = (&header[..]).get_i32() as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.ok()?;
        Some(String::from_utf8(body).unwrap())
    }

    #[tokio::test]
    async fn test_responses_follow_request_order() {
        let (mut client, _handle, pipeline) = start_pipeline(Duration::from_secs(5)).await;
        send(&mut client, "60:first").await;
        send(&mut client, "30:second").await;
        send(&mut client, "0:third").await;

        assert_eq!(recv(&mut client).await.as_deref(), Some("first"));
        assert_eq!(recv(&mut client).await.as_deref(), Some("second"));
        assert_eq!(recv(&mut client).await.as_deref(), Some("third"));

        drop(client);
        let outcome = pipeline.await.unwrap();
        assert_eq!(outcome.cause, CloseCause::PeerClosed);
        assert!(outcome.close_result.is_ok());
    }

    #[tokio::test]
    async fn test_failed_and_panicked_requests_are_skipped() {
        let (mut client, _handle, _pipeline) = start_pipeline(Duration::from_secs(5)).await;
        send(&mut client, "20:a").await;
        send(&mut client, "fail").await;
        send(&mut client, "panic").await;
        send(&mut client, "0:d").await;

        assert_eq!(recv(&mut client).await.as_deref(), Some("a"));
        assert_eq!(recv(&mut client).await.as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn test_half_closed_client_still_gets_responses() {
        let (mut client, _handle, pipeline) = start_pipeline(Duration::from_secs(5)).await;
        send(&mut client, "40:late").await;
        client.shutdown().await.unwrap();

        assert_eq!(recv(&mut client).await.as_deref(), Some("late"));
        assert_eq!(recv(&mut client).await, None);
        assert_eq!(pipeline.await.unwrap().cause, CloseCause::PeerClosed);
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (mut client, handle, pipeline) = start_pipeline(Duration::from_millis(50)).await;
        assert_eq!(recv(&mut client).await, None);

        let outcome = pipeline.await.unwrap();
        assert_eq!(
            outcome.cause,
            CloseCause::IdleTimeout(Duration::from_millis(50))
        );
        assert_eq!(handle.state(), PipelineState::Closed);
    }

    #[tokio::test]
    async fn test_malformed_frame_terminates_pipeline() {
        let (mut client, _handle, pipeline) = start_pipeline(Duration::from_secs(5)).await;
        client.write_all(&(-5i32).to_be_bytes()).await.unwrap();

        assert_eq!(recv(&mut client).await, None);
        assert!(matches!(
            pipeline.await.unwrap().cause,
            CloseCause::Decode(_)
        ));
    }

    #[tokio::test]
    async fn test_drain_flushes_dispatched_requests() {
        let (mut client, handle, pipeline) = start_pipeline(Duration::from_secs(5)).await;
        send(&mut client, "80:slow").await;
        // let the read stage pick the request up before draining
        time::sleep(Duration::from_millis(20)).await;
        handle.cancel(CloseCause::Drain);

        assert_eq!(recv(&mut client).await.as_deref(), Some("slow"));
        assert_eq!(recv(&mut client).await, None);
        assert_eq!(pipeline.await.unwrap().cause, CloseCause::Drain);
    }

    #[tokio::test]
    async fn test_forced_cancel_closes_without_waiting_for_handlers() {
        let (mut client, handle, pipeline) = start_pipeline(Duration::from_secs(5)).await;
        send(&mut client, "300:never").await;
        time::sleep(Duration::from_millis(20)).await;
        handle.cancel(CloseCause::Forced);

        let started = time::Instant::now();
        assert_eq!(recv(&mut client).await, None);
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(pipeline.await.unwrap().cause, CloseCause::Forced);
    }

    /// A socket whose every write fails with `kind`.
    struct FailingWriter(ErrorKind);

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(self.0)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(self.0)))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn write_one(kind: ErrorKind) -> Option<CloseCause> {
        let scope = CancelScope::new();
        let (tx, rx) = mpsc::channel(1);
        tx.send(Response {
            sequence: 0,
            payload: Bytes::from_static(b"lost"),
        })
        .await
        .unwrap();
        drop(tx);
        write_stage(
            BufWriter::new(FailingWriter(kind)),
            &LengthPrefixedCodec::new(64),
            rx,
            &scope,
        )
        .await;
        scope.cause()
    }

    #[tokio::test]
    async fn test_write_to_departed_peer_is_a_peer_close() {
        assert_eq!(
            write_one(ErrorKind::BrokenPipe).await,
            Some(CloseCause::PeerClosed)
        );
        assert_eq!(
            write_one(ErrorKind::ConnectionReset).await,
            Some(CloseCause::PeerClosed)
        );
    }

    #[tokio::test]
    async fn test_other_write_failures_are_write_errors() {
        assert!(matches!(
            write_one(ErrorKind::PermissionDenied).await,
            Some(CloseCause::Write(_))
        ));
    }
}
