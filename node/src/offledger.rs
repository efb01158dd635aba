//! Off-ledger requests on their way into a block.
//!
//! The API remembers what it was handed for a while so that clients
//! resubmitting the same request are answered without touching the chain.
//! Admitted requests are forwarded to a few committee peers, over and over,
//! until a block includes them.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use chain_vm::{OffLedgerRequest, RequestId};
use lru::LruCache;
use mockall::automock;
use tokio::time::{Duration, Instant};
use tracing::trace;

const CACHE_CAPACITY: usize = 16 * 1024;

/// Ids of recently submitted requests.
#[derive(Debug)]
pub struct OffLedgerCache {
    seen: LruCache<RequestId, Instant>,
    ttl: Duration,
}

impl OffLedgerCache {
    /// Remembers submissions for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN)),
            ttl,
        }
    }

    /// Records `id` as submitted now. Returns whether it was already
    /// submitted within the last `ttl`.
    pub fn check_and_insert(&mut self, id: RequestId) -> bool {
        let now = Instant::now();
        let fresh = self
            .seen
            .get(&id)
            .is_some_and(|at| now.duration_since(*at) < self.ttl);
        if !fresh {
            self.seen.put(id, now);
        }
        fresh
    }

    /// Forgets `id`, so that it can be submitted again.
    pub fn forget(&mut self, id: &RequestId) {
        self.seen.pop(id);
    }
}

/// Sends requests to other nodes of the committee.
#[automock]
pub trait PeerSender {
    /// Hands `request` to `peer`. Delivery is not confirmed.
    fn send(&self, peer: &str, request: &OffLedgerRequest);
}

/// Forwards pending requests to `fanout` peers at a time, taking turns
/// through the committee.
#[derive(Debug)]
pub struct Broadcaster<P> {
    sender: P,
    peers: Vec<String>,
    fanout: usize,
    cursor: usize,
    pending: BTreeMap<RequestId, OffLedgerRequest>,
}

impl<P: PeerSender> Broadcaster<P> {
    /// Forwards through `sender` to `fanout` of `peers` per tick.
    pub fn new(sender: P, peers: Vec<String>, fanout: usize) -> Self {
        Self {
            sender,
            peers,
            fanout,
            cursor: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Requests still forwarded.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Forwards `request` now and on every [`Broadcaster::tick`] until it is
    /// removed.
    pub fn add(&mut self, request: OffLedgerRequest) {
        self.forward(&request);
        self.pending.insert(request.id(), request);
    }

    /// Stops forwarding `id`.
    pub fn remove(&mut self, id: &RequestId) {
        self.pending.remove(id);
    }

    /// Forwards every pending request again.
    pub fn tick(&mut self) {
        let pending: Vec<_> = self.pending.values().cloned().collect();
        for request in &pending {
            self.forward(request);
        }
    }

    fn forward(&mut self, request: &OffLedgerRequest) {
        if self.peers.is_empty() {
            return;
        }
        let n = self.fanout.min(self.peers.len());
        for i in 0..n {
            let peer = &self.peers[(self.cursor + i) % self.peers.len()];
            trace!(%peer, request_id = %request.id(), "forwarding off-ledger request");
            self.sender.send(peer, request);
        }
        self.cursor = (self.cursor + n) % self.peers.len();
    }
}

#[cfg(test)]
mod tests {
    use anchor_ledger::AliasId;
    use chain_vm::request::CallTarget;
    use chain_vm::Hname;
    use ed25519_dalek::SigningKey;
    use kv_state::Dict;
    use mockall::Sequence;

    use super::*;

    fn request(nonce: u64) -> OffLedgerRequest {
        OffLedgerRequest::new(
            AliasId([1; 32]),
            CallTarget::new(Hname::from_name("accounts"), Hname::from_name("deposit")),
            Dict::new(),
            nonce,
            10_000,
        )
        .sign(&SigningKey::from_bytes(&[4; 32]))
    }

    fn peers() -> Vec<String> {
        ["a", "b", "c"].map(String::from).to_vec()
    }

    #[tokio::test(start_paused = true)]
    async fn cache_expires() {
        let mut cache = OffLedgerCache::new(Duration::from_secs(300));
        let id = request(0).id();
        assert!(!cache.check_and_insert(id));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(cache.check_and_insert(id));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!cache.check_and_insert(id));
        cache.forget(&id);
        assert!(!cache.check_and_insert(id));
    }

    #[test]
    fn peers_take_turns() {
        let mut sender = MockPeerSender::new();
        let mut seq = Sequence::new();
        for peer in ["a", "b", "c", "a"] {
            sender
                .expect_send()
                .withf(move |p, _| p.to_string() == peer)
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }
        let mut b = Broadcaster::new(sender, peers(), 2);
        b.add(request(0));
        b.tick();
        assert_eq!(b.pending(), 1);
    }

    #[test]
    fn removed_requests_are_not_forwarded() {
        let mut sender = MockPeerSender::new();
        sender.expect_send().times(2).return_const(());
        let mut b = Broadcaster::new(sender, peers(), 1);
        let req = request(0);
        b.add(req.clone());
        b.add(request(1));
        b.remove(&req.id());
        b.remove(&request(1).id());
        b.tick();
        assert_eq!(b.pending(), 0);
    }

    #[test]
    fn no_peers_no_forwarding() {
        let mut sender = MockPeerSender::new();
        sender.expect_send().never();
        let mut b = Broadcaster::new(sender, Vec::new(), 2);
        b.add(request(0));
        b.tick();
        assert_eq!(b.pending(), 1);
    }
}
