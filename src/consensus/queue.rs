//! Inbound ballot queue and the ballot broadcaster.

use super::ballot::Ballot;
use super::ballotbox::Ballotbox;
use crate::base::{CancellationToken, NodeAddress};
use crate::network::{ConnInfo, NetworkClient};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Bounded queue between the transports and the ballotbox. When full, the
/// oldest ballot is dropped.
pub struct BallotQueue {
    ballots: Mutex<VecDeque<Ballot>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl BallotQueue {
    pub fn new(capacity: usize) -> Self {
        BallotQueue {
            ballots: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false when an older ballot had to be dropped.
    pub fn push(&self, ballot: Ballot) -> bool {
        let dropped = {
            let mut ballots = self.ballots.lock();
            let dropped = if ballots.len() >= self.capacity {
                ballots.pop_front()
            } else {
                None
            };
            ballots.push_back(ballot);
            dropped
        };
        self.notify.notify_one();

        match dropped {
            Some(old) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(stagepoint = %old.stagepoint(), "ballot queue full, oldest dropped");
                false
            }
            None => true,
        }
    }

    pub fn pop(&self) -> Option<Ballot> {
        self.ballots.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.ballots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Feeds queued ballots to `ballotbox` until `cancel` fires.
    pub async fn run(self: Arc<Self>, ballotbox: Arc<Ballotbox>, cancel: CancellationToken) {
        loop {
            while let Some(ballot) = self.pop() {
                if cancel.is_canceled() {
                    return;
                }
                let sp = ballot.stagepoint();
                if let Err(e) = ballotbox.vote(ballot).await {
                    debug!(error = %e, stagepoint = %sp, "ballot rejected");
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.canceled() => return,
            }
        }
    }
}

/// Sends ballots to the suffrage peers, and to the local ballotbox when
/// asked.
pub struct Broadcaster {
    local: NodeAddress,
    client: Arc<dyn NetworkClient>,
    peers: Vec<ConnInfo>,
    queue: Arc<BallotQueue>,
    timeout: Duration,
}

impl Broadcaster {
    pub fn new(
        local: NodeAddress,
        client: Arc<dyn NetworkClient>,
        peers: Vec<ConnInfo>,
        queue: Arc<BallotQueue>,
        timeout: Duration,
    ) -> Self {
        let peers = peers.into_iter().filter(|p| p.address != local).collect();
        Broadcaster {
            local,
            client,
            peers,
            queue,
            timeout,
        }
    }

    pub fn peers(&self) -> &[ConnInfo] {
        &self.peers
    }

    pub fn conn(&self, address: &NodeAddress) -> Option<&ConnInfo> {
        self.peers.iter().find(|p| &p.address == address)
    }

    pub fn client(&self) -> Arc<dyn NetworkClient> {
        Arc::clone(&self.client)
    }

    /// Must be called inside a tokio runtime; peer sends run detached.
    pub fn broadcast(&self, ballot: Ballot, to_local: bool) {
        debug!(
            node = %self.local,
            stagepoint = %ballot.stagepoint(),
            peers = self.peers.len(),
            to_local,
            "broadcasting ballot"
        );
        if to_local {
            self.queue.push(ballot.clone());
        }
        if self.peers.is_empty() {
            return;
        }

        let ballots = Arc::new(vec![ballot]);
        for peer in self.peers.clone() {
            let client = Arc::clone(&self.client);
            let ballots = Arc::clone(&ballots);
            let timeout = self.timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, client.send_ballots(&peer, &ballots)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(peer = %peer, error = %e, "failed to send ballot"),
                    Err(_) => warn!(peer = %peer, "sending ballot timed out"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{Hash, LocalNode, NetworkId, Point, PrivateKey};

    fn ballot(round: u64) -> Ballot {
        let local = LocalNode::new(NodeAddress::new("a").unwrap(), PrivateKey::generate());
        let nid = NetworkId::new("n").unwrap();
        Ballot::init(
            &local,
            &nid,
            Point::new(crate::base::Height::new(1), crate::base::Round::new(round)),
            Hash::digest(b"prev"),
            Hash::digest(b"proposal"),
            None,
            vec![],
        )
    }

    #[test]
    fn drops_oldest_when_full() {
        let q = BallotQueue::new(2);
        assert!(q.push(ballot(0)));
        assert!(q.push(ballot(1)));
        assert!(!q.push(ballot(2)));

        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop().unwrap().point().round.get(), 1);
        assert_eq!(q.pop().unwrap().point().round.get(), 2);
        assert!(q.is_empty());
    }
}
