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

use std::io::{self, ErrorKind};
use std::net::Shutdown;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// A resource that is released by consuming it.
pub trait Close {
    fn close(self) -> io::Result<()>;
}

/// The accept loop holds its own clone of the listener and drops it as soon as
/// it observes the guard closing, which releases the socket.
impl Close for Arc<TcpListener> {
    fn close(self) -> io::Result<()> {
        drop(self);
        Ok(())
    }
}

impl Close for TcpStream {
    fn close(self) -> io::Result<()> {
        let stream = self.into_std()?;
        match stream.shutdown(Shutdown::Both) {
            // the peer got there first
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Wraps a resource so that it is closed at most once.
///
/// Every call to [`OnceClose::close`] after the first returns the result of the
/// first one. Dropping the guard closes the resource if nobody did.
#[derive(Debug)]
pub struct OnceClose<T: Close> {
    resource: Mutex<Option<T>>,
    outcome: OnceLock<Option<(ErrorKind, String)>>,
    closed: CancellationToken,
}

impl<T: Close> OnceClose<T> {
    pub fn new(resource: T) -> Self {
        OnceClose {
            resource: Mutex::new(Some(resource)),
            outcome: OnceLock::new(),
            closed: CancellationToken::new(),
        }
    }

    pub fn close(&self) -> io::Result<()> {
        let outcome = self.outcome.get_or_init(|| {
            self.closed.cancel();
            let resource = self.resource.lock().take();
            resource
                .map(Close::close)
                .and_then(|result| result.err())
                .map(|err| (err.kind(), err.to_string()))
        });
        match outcome {
            None => Ok(()),
            Some((kind, msg)) => Err(io::Error::new(*kind, msg.clone())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`OnceClose::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Exclusive access for the owner; `None` once closed.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.resource.get_mut().as_mut()
    }
}

impl<T: Close + Clone> OnceClose<T> {
    /// A shared handle to the resource; `None` once closed.
    pub fn get(&self) -> Option<T> {
        self.resource.lock().clone()
    }
}

impl<T: Close> Drop for OnceClose<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
