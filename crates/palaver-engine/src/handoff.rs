//! Blocking work handed to a worker thread.
//!
//! Name resolution is the one blocking call the engine cannot avoid. It runs
//! on its own thread and posts the answer through a oneshot channel that the
//! loop thread polls without blocking.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::task::Poll;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, warn};

/// An in-flight DNS lookup.
#[derive(Debug)]
pub struct PendingResolution {
    host: String,
    rx: oneshot::Receiver<io::Result<Vec<SocketAddr>>>,
}

impl PendingResolution {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Checks for the answer. Never blocks.
    pub fn poll(&mut self) -> Poll<io::Result<Vec<SocketAddr>>> {
        match self.rx.try_recv() {
            Ok(result) => Poll::Ready(result),
            Err(TryRecvError::Empty) => Poll::Pending,
            Err(TryRecvError::Closed) => Poll::Ready(Err(io::Error::other(
                "resolver thread exited without an answer",
            ))),
        }
    }
}

/// Resolves `host:port` on a worker thread.
pub fn resolve_in_background(host: impl Into<String>, port: u16) -> PendingResolution {
    let host = host.into();
    let (tx, rx) = oneshot::channel();
    let lookup = host.clone();
    let spawned = std::thread::Builder::new()
        .name("palaver-resolver".into())
        .spawn(move || {
            let result = (lookup.as_str(), port)
                .to_socket_addrs()
                .map(|addrs| addrs.collect::<Vec<_>>());
            if tx.send(result).is_err() {
                debug!(host = %lookup, "resolution finished after the requester went away");
            }
        });
    if let Err(e) = spawned {
        // The sender was dropped with the closure, so poll() reports Closed.
        warn!(host = %host, error = %e, "failed to spawn resolver thread");
    }
    PendingResolution { host, rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait(pending: &mut PendingResolution) -> io::Result<Vec<SocketAddr>> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Poll::Ready(result) = pending.poll() {
                return result;
            }
            assert!(Instant::now() < deadline, "resolution did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn resolves_literal_address() {
        let mut pending = resolve_in_background("127.0.0.1", 1080);
        assert_eq!(pending.host(), "127.0.0.1");

        let addrs = wait(&mut pending).expect("resolved");
        assert_eq!(addrs, vec!["127.0.0.1:1080".parse::<SocketAddr>().expect("addr")]);
    }

    #[test]
    fn vanished_worker_is_an_error() {
        let (tx, rx) = oneshot::channel();
        let mut pending = PendingResolution {
            host: "proxy.example.com".into(),
            rx,
        };
        assert!(pending.poll().is_pending());

        drop(tx);
        assert!(matches!(pending.poll(), Poll::Ready(Err(_))));
    }
}
