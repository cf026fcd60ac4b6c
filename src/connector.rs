//! Neighbor channels used for ghost exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::debug;

use crate::{block::BlockId, error::RunnerError, Float};

/// How often a blocked `recv` re-checks the quit event.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation flag shared by all runners of a simulation.
#[derive(Debug, Clone, Default)]
pub struct QuitEvent {
    flag: Arc<AtomicBool>,
}

impl QuitEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The underlying flag, for registration with signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}

/// Bidirectional channel to exactly one neighbor block.
pub trait Connector: Send {
    /// Id of the block on the other end.
    fn neighbor(&self) -> BlockId;

    /// Sends one message; must not block until the peer receives it.
    /// Messages to a peer that already stopped are dropped.
    fn send(&self, data: &[Float]) -> anyhow::Result<()>;

    /// Blocks until a message arrives and copies it into `buf`. Returns
    /// `Ok(false)` if `quit` was set before data arrived.
    fn recv(&self, buf: &mut [Float], quit: &QuitEvent) -> anyhow::Result<bool>;
}

/// In-process connector backed by a pair of unbounded crossbeam channels.
pub struct ChannelConnector {
    neighbor: BlockId,
    tx: Sender<Vec<Float>>,
    rx: Receiver<Vec<Float>>,
}

impl ChannelConnector {
    /// Creates both ends of a connection between blocks `a` and `b`. The
    /// first connector belongs to `a` and talks to `b`.
    pub fn pair(a: BlockId, b: BlockId) -> (Self, Self) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            Self { neighbor: b, tx: a_tx, rx: a_rx },
            Self { neighbor: a, tx: b_tx, rx: b_rx },
        )
    }
}

impl Connector for ChannelConnector {
    fn neighbor(&self) -> BlockId {
        self.neighbor
    }

    fn send(&self, data: &[Float]) -> anyhow::Result<()> {
        if self.tx.send(data.to_vec()).is_err() {
            debug!("Dropping message to stopped block {}", self.neighbor);
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [Float], quit: &QuitEvent) -> anyhow::Result<bool> {
        loop {
            if quit.is_set() {
                return Ok(false);
            }
            match self.rx.recv_timeout(RECV_POLL_INTERVAL) {
                Ok(message) => {
                    if message.len() != buf.len() {
                        return Err(RunnerError::transport(format!(
                            "expected {} values from block {}, got {}",
                            buf.len(),
                            self.neighbor,
                            message.len()
                        ))
                        .into());
                    }
                    buf.copy_from_slice(&message);
                    return Ok(true);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) if quit.is_set() => return Ok(false),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RunnerError::transport(format!(
                        "block {} hung up", self.neighbor
                    ))
                    .into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pair_delivers_both_ways() {
        let (a, b) = ChannelConnector::pair(0, 1);
        assert_eq!(a.neighbor(), 1);
        assert_eq!(b.neighbor(), 0);
        let quit = QuitEvent::new();

        a.send(&[1.0, 2.0]).unwrap();
        b.send(&[3.0, 4.0]).unwrap();

        let mut buf = [0.0; 2];
        assert!(b.recv(&mut buf, &quit).unwrap());
        assert_eq!(buf, [1.0, 2.0]);
        assert!(a.recv(&mut buf, &quit).unwrap());
        assert_eq!(buf, [3.0, 4.0]);
    }

    #[test]
    fn recv_is_cancelled_by_quit_event() {
        let (a, _b) = ChannelConnector::pair(0, 1);
        let quit = QuitEvent::new();
        let setter = quit.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });
        let mut buf = [0.0; 4];
        assert!(!a.recv(&mut buf, &quit).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn size_mismatch_is_an_error() {
        let (a, b) = ChannelConnector::pair(0, 1);
        a.send(&[1.0]).unwrap();
        let mut buf = [0.0; 2];
        let err = b.recv(&mut buf, &QuitEvent::new()).unwrap_err();
        assert!(matches!(err.downcast_ref::<RunnerError>(), Some(RunnerError::Transport(_))));
    }

    #[test]
    fn disconnected_peer_fails_recv_only() {
        let (a, b) = ChannelConnector::pair(0, 1);
        b.send(&[5.0]).unwrap();
        drop(b);
        let mut buf = [0.0; 1];
        assert!(a.recv(&mut buf, &QuitEvent::new()).unwrap());
        assert_eq!(buf, [5.0]);
        assert!(a.recv(&mut buf, &QuitEvent::new()).is_err());
        assert!(a.send(&buf).is_ok());

        let quit = QuitEvent::new();
        quit.set();
        assert!(!a.recv(&mut buf, &quit).unwrap());
    }
}
