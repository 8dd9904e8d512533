use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::network::{Close, ConnectionPipeline, OnceClose};
use crate::protocol::Codec;
use crate::request::Handler;
use crate::{AppError, AppResult};

use super::registry::{ConnectionHandle, ConnectionId, ConnectionInfo, ConnectionRegistry};
use super::{CancelScope, CloseCause, ServerConfig};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    ShuttingDown,
    Stopped,
}

/// A broker front end: accepts TCP connections and runs one
/// [`ConnectionPipeline`] per connection.
///
/// The server is meant to be shared behind an `Arc`: one task runs
/// [`Server::start`] (or [`Server::bind`] followed by [`Server::serve`]) while
/// the owner keeps a handle to call [`Server::shutdown`] or
/// [`Server::force_shutdown`].
///
/// Shutdown sequence:
/// 1. the listener is closed through its once-close guard, which ends the accept loop;
/// 2. the connection registry is sealed so that nothing accepted concurrently slips through;
/// 3. every registered pipeline is cancelled, with `Drain` for a graceful
///    shutdown and `Forced` for a forced one;
/// 4. a graceful shutdown then waits on the task tracker until every pipeline
///    has flushed its responses and closed its socket.
#[derive(Debug)]
pub struct Server<C, H> {
    config: Arc<ServerConfig>,
    codec: Arc<C>,
    handler: Arc<H>,
    state: Mutex<ServerState>,
    listener: OnceLock<OnceClose<Arc<TcpListener>>>,
    local_addr: OnceLock<SocketAddr>,
    accepting: AtomicBool,
    registry: Arc<ConnectionRegistry>,
    scope: CancelScope,
    tracker: TaskTracker,
    next_connection_id: AtomicU64,
    close_failures: Arc<Mutex<Vec<String>>>,
}

impl<C, H> Server<C, H>
where
    C: Codec,
    H: Handler<Request = C::Request, Response = C::Response>,
{
    pub fn new(config: ServerConfig, codec: C, handler: H) -> AppResult<Self> {
        config.validate()?;
        Ok(Server {
            config: Arc::new(config),
            codec: Arc::new(codec),
            handler: Arc::new(handler),
            state: Mutex::new(ServerState::Created),
            listener: OnceLock::new(),
            local_addr: OnceLock::new(),
            accepting: AtomicBool::new(false),
            registry: Arc::new(ConnectionRegistry::new()),
            scope: CancelScope::new(),
            tracker: TaskTracker::new(),
            next_connection_id: AtomicU64::new(1),
            close_failures: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock()
    }

    /// The bound address, once [`Server::bind`] succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry
            .snapshot()
            .iter()
            .map(ConnectionHandle::info)
            .collect()
    }

    /// Binds the listener and runs the accept loop until the listener is closed.
    pub async fn start(&self) -> AppResult<()> {
        self.bind().await?;
        self.serve().await
    }

    /// Binds the listening socket on the configured `host:port` and returns the
    /// bound address.
    pub async fn bind(&self) -> AppResult<SocketAddr> {
        let current = self.state();
        if current != ServerState::Created {
            return Err(AppError::IllegalStateError(format!(
                "server cannot bind in state {:?}",
                current
            )));
        }

        let listen_address = self.config.listen_address();
        let listener = TcpListener::bind(&listen_address).await.map_err(|source| {
            error!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, source
            );
            AppError::Bind {
                addr: listen_address.clone(),
                source,
            }
        })?;
        let local_addr = listener.local_addr()?;

        let mut state = self.state.lock();
        if *state != ServerState::Created
            || self.listener.set(OnceClose::new(Arc::new(listener))).is_err()
        {
            return Err(AppError::IllegalStateError(format!(
                "server cannot bind in state {:?}",
                *state
            )));
        }
        let _ = self.local_addr.set(local_addr);
        *state = ServerState::Listening;
        info!("tcp server binding to {} for listening", local_addr);
        Ok(local_addr)
    }

    /// Runs the accept loop.
    ///
    /// # Returns
    /// `Ok(())` once the listener is closed by a shutdown. Accept errors are
    /// logged and retried with a capped backoff; they never end the loop.
    pub async fn serve(&self) -> AppResult<()> {
        let guard = self
            .listener
            .get()
            .ok_or_else(|| AppError::IllegalStateError("serve called before bind".into()))?;
        if self.accepting.swap(true, Ordering::SeqCst) {
            return Err(AppError::IllegalStateError(
                "accept loop is already running".into(),
            ));
        }
        let Some(listener) = guard.get() else {
            debug!("Listener is closed");
            return Ok(());
        };

        info!("broker server started");
        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            let accepted = tokio::select! {
                biased;
                _ = guard.closed() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, remote_addr)) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    self.spawn_pipeline(socket, remote_addr);
                }
                Err(err) => {
                    error!(cause = %err, "Error accepting connection");
                    tokio::select! {
                        _ = guard.closed() => break,
                        _ = time::sleep(backoff) => {}
                    }
                    backoff = next_accept_backoff(backoff);
                }
            }
        }

        drop(listener);
        if let Err(err) = guard.close() {
            error!("Error closing listener: {}", err);
        }
        debug!("Listener is closed");
        Ok(())
    }

    fn spawn_pipeline(&self, socket: TcpStream, remote_addr: SocketAddr) {
        // a shutdown sealing the registry after register() must still wait for this pipeline
        let _tracked = self.tracker.token();
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let socket = OnceClose::new(socket);
        let handle = ConnectionHandle::new(connection_id, remote_addr, self.scope.child());
        if !self.registry.register(handle.clone()) {
            debug!(
                "refusing connection {} from {}: server is shutting down",
                connection_id, remote_addr
            );
            if let Err(err) = socket.close() {
                debug!("Error closing refused connection {}: {}", remote_addr, err);
            }
            return;
        }
        debug!("accept new connection {} from {}", connection_id, remote_addr);

        let pipeline = ConnectionPipeline::new(
            handle,
            socket,
            self.codec.clone(),
            self.handler.clone(),
            self.config.clone(),
        );
        let registry = self.registry.clone();
        let close_failures = self.close_failures.clone();
        self.tracker.spawn(async move {
            let outcome = pipeline.run().await;
            registry.deregister(connection_id);

            match &outcome.cause {
                CloseCause::Write(_) | CloseCause::Internal(_) => {
                    error!(
                        "Error handling connection {} from {}: {}",
                        connection_id, remote_addr, outcome.cause
                    );
                }
                cause => {
                    debug!(
                        "connection {} from {} closed: {}",
                        connection_id, remote_addr, cause
                    );
                }
            }
            if let Err(err) = outcome.close_result {
                warn!("Error closing connection {}: {}", remote_addr, err);
                if outcome.cause.is_shutdown() {
                    close_failures
                        .lock()
                        .push(format!("connection {} ({}): {}", connection_id, remote_addr, err));
                }
            }
        });
    }

    /// Cancels one connection abortively. Returns whether it was registered.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.registry.get(id) {
            Some(handle) => {
                debug!("force closing connection {} from {}", id, handle.remote_addr());
                handle.cancel(CloseCause::Forced);
                true
            }
            None => false,
        }
    }

    /// Closes the listener and every connection without waiting for in-flight
    /// requests. Returns as soon as everything has been told to close; the
    /// registry is empty afterwards. Calling it again is a no-op.
    pub fn force_shutdown(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            if *state == ServerState::Stopped {
                debug!("server already stopped");
                return Ok(());
            }
            *state = ServerState::ShuttingDown;
        }
        info!("Force shutting down broker server");

        let mut failures = Vec::new();
        if let Some(listener) = self.listener.get() {
            close_guard("listener", listener, &mut failures);
        }

        self.scope.cancel(CloseCause::Forced);
        let connections = self.registry.seal_and_drain();
        for handle in &connections {
            handle.cancel(CloseCause::Forced);
        }
        self.tracker.close();
        *self.state.lock() = ServerState::Stopped;
        info!("force closed {} connections", connections.len());

        shutdown_result(failures)
    }

    /// Stops accepting, lets every connection finish the requests it already
    /// dispatched and flush their responses, then waits for all of them to
    /// close. Failures closing the listener or a connection are collected into
    /// one [`AppError::Shutdown`]; they never stop the remaining closes.
    pub async fn shutdown(&self) -> AppResult<()> {
        {
            let mut state = self.state.lock();
            if *state == ServerState::Stopped {
                debug!("server already stopped");
                return Ok(());
            }
            *state = ServerState::ShuttingDown;
        }
        info!("Gracefully shutting down broker server");

        let mut failures = Vec::new();
        if let Some(listener) = self.listener.get() {
            close_guard("listener", listener, &mut failures);
        }

        let connections = self.registry.seal();
        for handle in &connections {
            handle.cancel(CloseCause::Drain);
        }
        self.scope.cancel(CloseCause::Drain);

        self.tracker.close();
        debug!("waiting for {} connections to drain", connections.len());
        self.tracker.wait().await;

        failures.extend(self.close_failures.lock().drain(..));
        *self.state.lock() = ServerState::Stopped;
        info!("broker server shutdown complete");

        shutdown_result(failures)
    }
}

fn next_accept_backoff(current: Duration) -> Duration {
    (current * 2).min(ACCEPT_BACKOFF_MAX)
}

/// Closes `guard`, recording a failure instead of stopping the shutdown.
fn close_guard<T: Close>(what: &str, guard: &OnceClose<T>, failures: &mut Vec<String>) {
    if let Err(err) = guard.close() {
        error!("Error closing {}: {}", what, err);
        failures.push(format!("{}: {}", what, err));
    }
}

fn shutdown_result(failures: Vec<String>) -> AppResult<()> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(AppError::Shutdown(failures))
    }
}

impl<C, H> Drop for Server<C, H> {
    fn drop(&mut self) {
        debug!("tcp server dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::io::{self, ErrorKind};

    use super::*;

    struct FailingClose(&'static str);

    impl Close for FailingClose {
        fn close(self) -> io::Result<()> {
            Err(io::Error::new(ErrorKind::Other, self.0))
        }
    }

    struct CleanClose;

    impl Close for CleanClose {
        fn close(self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_close_failures_are_aggregated() {
        let first = OnceClose::new(FailingClose("listener gone"));
        let clean = OnceClose::new(CleanClose);
        let second = OnceClose::new(FailingClose("socket gone"));

        let mut failures = Vec::new();
        close_guard("listener", &first, &mut failures);
        close_guard("connection 1", &clean, &mut failures);
        close_guard("connection 2", &second, &mut failures);
        // one failure never stops the remaining closes
        assert!(first.is_closed() && clean.is_closed() && second.is_closed());

        match shutdown_result(failures) {
            Err(AppError::Shutdown(failures)) => assert_eq!(
                failures,
                vec![
                    "listener: listener gone".to_string(),
                    "connection 2: socket gone".to_string()
                ]
            ),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_clean_closes_are_ok() {
        let mut failures = Vec::new();
        close_guard("listener", &OnceClose::new(CleanClose), &mut failures);
        assert!(shutdown_result(failures).is_ok());
    }

    #[test]
    fn test_accept_backoff_doubles_up_to_cap() {
        let mut backoff = ACCEPT_BACKOFF_MIN;
        let mut seen = vec![backoff];
        for _ in 0..12 {
            backoff = next_accept_backoff(backoff);
            seen.push(backoff);
        }
        assert_eq!(seen[1], ACCEPT_BACKOFF_MIN * 2);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), ACCEPT_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn test_force_shutdown_before_bind_is_ok() {
        let config = ServerConfig::new("127.0.0.1", 0, Duration::from_secs(1)).unwrap();
        let server = Server::new(
            config,
            crate::LengthPrefixedCodec::new(64),
            crate::HelloHandler,
        )
        .unwrap();
        // never bound: nothing to close, nothing to aggregate
        assert!(server.force_shutdown().is_ok());
        assert_eq!(server.state(), ServerState::Stopped);
    }
}
