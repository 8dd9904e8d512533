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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Why a connection pipeline (or the whole server) stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// The peer closed its side after its last complete frame.
    PeerClosed,
    /// No complete request arrived within the idle timeout.
    IdleTimeout(Duration),
    /// The byte stream could not be decoded.
    Decode(String),
    /// The pipeline itself broke, e.g. a response failed to encode.
    Internal(String),
    /// Writing a response to the socket failed.
    Write(String),
    /// Graceful shutdown: finish what was dispatched, then close.
    Drain,
    /// Forced shutdown: close now.
    Forced,
}

impl CloseCause {
    /// Graceful causes let the write stage flush every response of an
    /// already-dispatched request before the socket is closed.
    pub fn is_graceful(&self) -> bool {
        matches!(self, CloseCause::PeerClosed | CloseCause::Drain)
    }

    /// Whether the cause is the consequence of a shutdown request rather than
    /// something that happened on the connection.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, CloseCause::Drain | CloseCause::Forced)
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseCause::PeerClosed => write!(f, "peer closed the connection"),
            CloseCause::IdleTimeout(timeout) => {
                write!(f, "idle for more than {} ms", timeout.as_millis())
            }
            CloseCause::Decode(msg) => write!(f, "decode error: {}", msg),
            CloseCause::Internal(msg) => write!(f, "internal error: {}", msg),
            CloseCause::Write(msg) => write!(f, "write error: {}", msg),
            CloseCause::Drain => write!(f, "graceful shutdown"),
            CloseCause::Forced => write!(f, "forced shutdown"),
        }
    }
}

#[derive(Debug)]
struct ScopeInner {
    /// cancelled by any cause
    stop: CancellationToken,
    /// cancelled only by abortive causes
    abort: CancellationToken,
    cause: Mutex<Option<CloseCause>>,
    parent: Option<CancelScope>,
}

/// A hierarchical cancellation scope carrying the cause of its cancellation.
///
/// The server owns the root scope, every connection pipeline runs in a child of
/// it. Cancelling a parent cancels all children; a child reports the parent's
/// cause unless it recorded one of its own first.
///
/// Two signals are exposed: [`CancelScope::stopped`] fires for every cause and
/// tells readers to stop taking in new work, [`CancelScope::aborted`] fires only
/// for abortive causes and tells writers to give up on pending output.
#[derive(Debug, Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    pub fn new() -> CancelScope {
        CancelScope {
            inner: Arc::new(ScopeInner {
                stop: CancellationToken::new(),
                abort: CancellationToken::new(),
                cause: Mutex::new(None),
                parent: None,
            }),
        }
    }

    pub fn child(&self) -> CancelScope {
        CancelScope {
            inner: Arc::new(ScopeInner {
                stop: self.inner.stop.child_token(),
                abort: self.inner.abort.child_token(),
                cause: Mutex::new(None),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancels the scope. The first cause wins, except that an abortive cause
    /// replaces a graceful one. Returns whether `cause` was recorded.
    pub fn cancel(&self, cause: CloseCause) -> bool {
        let graceful = cause.is_graceful();
        let recorded = {
            let mut slot = self.inner.cause.lock();
            match slot.as_ref() {
                None => {
                    *slot = Some(cause);
                    true
                }
                Some(current) if current.is_graceful() && !graceful => {
                    *slot = Some(cause);
                    true
                }
                Some(_) => false,
            }
        };
        self.inner.stop.cancel();
        if !graceful {
            self.inner.abort.cancel();
        }
        recorded
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.abort.is_cancelled()
    }

    pub async fn stopped(&self) {
        self.inner.stop.cancelled().await
    }

    pub async fn aborted(&self) {
        self.inner.abort.cancelled().await
    }

    /// The recorded cause, falling back to the nearest cancelled ancestor's.
    /// An abortive ancestor cause outranks a graceful local one.
    pub fn cause(&self) -> Option<CloseCause> {
        let own = self.inner.cause.lock().clone();
        let inherited = match &self.inner.parent {
            Some(parent) if self.is_stopped() => parent.cause(),
            _ => None,
        };
        match (own, inherited) {
            (Some(own), Some(inherited)) if own.is_graceful() && !inherited.is_graceful() => {
                Some(inherited)
            }
            (Some(own), _) => Some(own),
            (None, inherited) => inherited,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cause_wins() {
        let scope = CancelScope::new();
        assert!(scope.cause().is_none());
        assert!(scope.cancel(CloseCause::IdleTimeout(Duration::from_millis(50))));
        assert!(!scope.cancel(CloseCause::Write("broken pipe".into())));
        assert_eq!(
            scope.cause(),
            Some(CloseCause::IdleTimeout(Duration::from_millis(50)))
        );
        assert!(scope.is_stopped());
        assert!(scope.is_aborted());
    }

    #[test]
    fn test_graceful_cause_only_stops() {
        let scope = CancelScope::new();
        scope.cancel(CloseCause::Drain);
        assert!(scope.is_stopped());
        assert!(!scope.is_aborted());

        // escalation
        assert!(scope.cancel(CloseCause::Forced));
        assert!(scope.is_aborted());
        assert_eq!(scope.cause(), Some(CloseCause::Forced));

        // no way back
        assert!(!scope.cancel(CloseCause::Drain));
        assert_eq!(scope.cause(), Some(CloseCause::Forced));
    }

    #[test]
    fn test_child_inherits_parent_cause() {
        let root = CancelScope::new();
        let first = root.child();
        let second = root.child();

        second.cancel(CloseCause::Decode("bad frame".into()));
        assert!(!root.is_stopped());
        assert!(!first.is_stopped());

        root.cancel(CloseCause::Forced);
        assert!(first.is_stopped());
        assert!(first.is_aborted());
        assert_eq!(first.cause(), Some(CloseCause::Forced));
        // own cause takes precedence
        assert_eq!(second.cause(), Some(CloseCause::Decode("bad frame".into())));
    }

    #[test]
    fn test_forced_parent_overrides_draining_child() {
        let root = CancelScope::new();
        let child = root.child();
        child.cancel(CloseCause::Drain);
        assert!(!child.is_aborted());

        root.cancel(CloseCause::Forced);
        assert!(child.is_aborted());
        assert_eq!(child.cause(), Some(CloseCause::Forced));
    }

    #[tokio::test]
    async fn test_stopped_resolves_after_cancel() {
        let scope = CancelScope::new();
        let child = scope.child();
        let waiter = tokio::spawn(async move {
            child.stopped().await;
            child.cause()
        });
        scope.cancel(CloseCause::Drain);
        assert_eq!(waiter.await.unwrap(), Some(CloseCause::Drain));
    }
}
