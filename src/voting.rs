//! Maekawa-style Voting: each node owns exactly one vote, a requester needs
//! a majority, and a voter rescinds an already-granted vote when a
//! higher-priority request arrives, to avoid deadlock.
//!
//! Grounded on `original_source/Voting-Protocol/node/node.go`. The open
//! questions in spec.md §9 are resolved as recorded in DESIGN.md: simple
//! majority of the full membership (`N / 2 + 1`), no self-vote, per-send id
//! capture (free in Rust — no shared loop variable to capture), and an
//! in-process release for the rescind-acknowledgement path.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::info;

use crate::clock::{LamportClock, NO_REQUEST};
use crate::membership::{bootstrap_addr, Membership};
use crate::pqueue::PriorityQueue;
use crate::wire::{self, Ack};
use crate::{CS_DELAY, RECV_DELAY};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Request {
        sender_id: u32,
        sender_addr: SocketAddr,
        clock: i64,
        req_time: i64,
    },
    Vote {
        sender_id: u32,
        sender_addr: SocketAddr,
        clock: i64,
    },
    Release {
        sender_id: u32,
        clock: i64,
    },
    RescindVote {
        sender_id: u32,
        sender_addr: SocketAddr,
        clock: i64,
    },
    /// Not in spec.md §3's Voting row (listed only for SPQ), but required by
    /// §6's generic join/start process controls and present verbatim in
    /// `original_source/Voting-Protocol/node/node.go`'s `AddNode`.
    AddNode {
        id: u32,
        addr: SocketAddr,
    },
    StartRequest,
    SetRequesting {
        num_requests: u32,
    },
    NotifyFinished {
        id: u32,
    },
}

/// The RPC reply to a RESCIND-VOTE call — spec.md §3's `ACK | DENY` response
/// kinds, modeled as the call's return type rather than a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescindReply {
    Ack,
    Deny,
}

/// Simple majority of the full membership (spec.md §9 open question #1):
/// `N / 2 + 1`, where `N` includes the requester itself.
pub fn majority_threshold(n: usize) -> usize {
    n / 2 + 1
}

struct Inner {
    clock: LamportClock,
    requesting: bool,
    req_time: i64,
    votes_available: u8,
    /// whom this node currently backs: `(id, req_time)`; addr is resolved
    /// through `peers` when needed.
    prev_vote: Option<(u32, i64)>,
    votes_received: HashSet<u32>,
    queue: PriorityQueue,
    finished: bool,
}

pub struct Node {
    pub id: u32,
    pub addr: SocketAddr,
    peers: Mutex<Membership>,
    inner: Mutex<Inner>,
    completed: Mutex<HashSet<u32>>,
    completion_notify: Notify,
}

impl Node {
    pub fn new(id: u32, addr: SocketAddr, peers: Membership) -> Self {
        Self {
            id,
            addr,
            peers: Mutex::new(peers),
            inner: Mutex::new(Inner {
                clock: LamportClock::new(),
                requesting: false,
                req_time: NO_REQUEST,
                votes_available: 1,
                prev_vote: None,
                votes_received: HashSet::new(),
                queue: PriorityQueue::new(),
                finished: false,
            }),
            completed: Mutex::new(HashSet::new()),
            completion_notify: Notify::new(),
        }
    }

    pub async fn set_requesting(&self, requesting: bool) {
        self.inner.lock().await.requesting = requesting;
    }

    pub async fn handle_set_requesting(&self, num_requests: u32) {
        self.inner.lock().await.requesting = self.id < num_requests;
    }

    pub async fn handle_add_node(&self, id: u32, addr: SocketAddr) {
        let mut peers = self.peers.lock().await;
        peers.insert(id, addr);
        info!(node = self.id, peer = id, %addr, "added node to the network");
    }

    pub async fn handle_notify_finished(&self, id: u32) {
        self.completed.lock().await.insert(id);
        self.completion_notify.notify_waiters();
    }

    /// `notified()` is registered (`enable`d) before the subset check so a
    /// `notify_waiters()` landing between the check and the `.await` is not
    /// lost — see `ring::Node::wait_for_completion` for the full rationale.
    pub async fn wait_for_completion(&self, expected: &HashSet<u32>) {
        loop {
            let notified = self.completion_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let completed = self.completed.lock().await;
                if expected.is_subset(&completed) {
                    return;
                }
            }

            notified.await;
        }
    }

    /// `begin-request`: tick the clock, commit a request timestamp, and
    /// broadcast REQUEST to every peer.
    pub async fn begin_request(self: &Arc<Self>) {
        let requesting = self.inner.lock().await.requesting;
        if !requesting {
            return;
        }
        let (req_time, peers) = {
            let mut inner = self.inner.lock().await;
            inner.clock.tick();
            inner.req_time = inner.clock.value();
            (inner.req_time, self.peers.lock().await.peers_excluding(self.id))
        };

        for (peer_id, addr) in peers {
            let node = self.clone();
            tokio::spawn(async move {
                let clock = node.inner.lock().await.clock.tick();
                let message = Message::Request {
                    sender_id: node.id,
                    sender_addr: node.addr,
                    clock,
                    req_time,
                };
                info!(node = node.id, peer = peer_id, "sending a request");
                if let Err(err) = wire::call::<_, Ack>(addr, &message).await {
                    tracing::warn!(node = node.id, peer = peer_id, %err, "error occurred while sending a request");
                }
            });
        }
    }

    /// `on-receive REQUEST`: grant the vote if one is available; otherwise
    /// queue the requester and rescind our current vote if it now outranks
    /// who we were backing.
    pub async fn on_receive_request(self: &Arc<Self>, msg: Message) -> anyhow::Result<Ack> {
        let Message::Request {
            sender_id,
            sender_addr,
            clock,
            req_time,
        } = msg
        else {
            anyhow::bail!("on_receive_request called with a non-Request message")
        };
        tokio::time::sleep(RECV_DELAY).await;
        info!(node = self.id, peer = sender_id, "received a request");

        enum Outcome {
            Vote,
            Rescind { target_id: u32, target_req_time: i64 },
            Queued,
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            inner.clock.observe(clock);
            if inner.votes_available > 0 {
                inner.votes_available -= 1;
                inner.prev_vote = Some((sender_id, req_time));
                Outcome::Vote
            } else {
                inner.queue.push((req_time, sender_id));
                match inner.prev_vote {
                    Some((prev_id, prev_req_time)) if (req_time, sender_id) < (prev_req_time, prev_id) => {
                        Outcome::Rescind {
                            target_id: prev_id,
                            target_req_time: prev_req_time,
                        }
                    }
                    _ => Outcome::Queued,
                }
            }
        };

        match outcome {
            Outcome::Vote => {
                let clock = self.inner.lock().await.clock.tick();
                let message = Message::Vote {
                    sender_id: self.id,
                    sender_addr: self.addr,
                    clock,
                };
                info!(node = self.id, peer = sender_id, "sending a vote");
                if let Err(err) = wire::call::<_, Ack>(sender_addr, &message).await {
                    tracing::warn!(node = self.id, peer = sender_id, %err, "error occurred while sending a vote");
                }
            }
            Outcome::Rescind { target_id, target_req_time } => {
                self.rescind_vote(target_id, target_req_time).await;
            }
            Outcome::Queued => {}
        }
        Ok(Ack)
    }

    /// Initiator side of RESCIND-VOTE (spec.md §4.3): ask the currently
    /// backed node to give up our vote; on ACK reclaim it locally and
    /// re-enqueue the rescinded party; on DENY leave state unchanged.
    async fn rescind_vote(self: &Arc<Self>, target_id: u32, target_req_time: i64) {
        let Some(addr) = self.peers.lock().await.addr_for(target_id) else {
            tracing::warn!(node = self.id, peer = target_id, "no known address for rescind target");
            return;
        };
        let clock = self.inner.lock().await.clock.tick();
        let message = Message::RescindVote {
            sender_id: self.id,
            sender_addr: self.addr,
            clock,
        };
        info!(node = self.id, peer = target_id, "sending a rescind vote");
        let reply = match wire::call::<_, RescindReply>(addr, &message).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(node = self.id, peer = target_id, %err, "error occurred while sending a rescind vote");
                return;
            }
        };
        match reply {
            RescindReply::Deny => {
                // the rescinded party is already committed; leave state unchanged
            }
            RescindReply::Ack => {
                self.inner.lock().await.clock.tick();
                self.do_release().await;
                self.inner.lock().await.queue.push((target_req_time, target_id));
                info!(node = self.id, peer = target_id, "added node to the queue");
            }
        }
    }

    /// `on-receive VOTE`: count it; enter the CS once a majority has been
    /// collected, else if already finished return the late vote immediately.
    pub async fn on_receive_vote(self: &Arc<Self>, msg: Message) -> anyhow::Result<Ack> {
        let Message::Vote { sender_id, clock, .. } = msg else {
            anyhow::bail!("on_receive_vote called with a non-Vote message")
        };
        tokio::time::sleep(RECV_DELAY).await;
        info!(node = self.id, peer = sender_id, "received a vote");

        let member_count = self.peers.lock().await.len() + 1;
        let threshold = majority_threshold(member_count);

        let (enter_cs, release_all) = {
            let mut inner = self.inner.lock().await;
            inner.clock.observe(clock);
            inner.votes_received.insert(sender_id);
            if !inner.finished && inner.votes_received.len() >= threshold {
                inner.finished = true;
                (true, false)
            } else if inner.finished {
                (false, true)
            } else {
                (false, false)
            }
        };

        if enter_cs {
            critical_section(self.id).await;
            self.release_all().await;
            notify_bootstrap(self.id).await;
        } else if release_all {
            self.release_all().await;
        }
        Ok(Ack)
    }

    /// `on-receive RELEASE`: reset our vote, then if anyone is queued, grant
    /// it to the head of the queue.
    pub async fn on_receive_release(self: &Arc<Self>, msg: Message) -> anyhow::Result<Ack> {
        let Message::Release { sender_id, clock } = msg else {
            anyhow::bail!("on_receive_release called with a non-Release message")
        };
        tokio::time::sleep(RECV_DELAY).await;
        info!(node = self.id, peer = sender_id, "received a release");
        self.inner.lock().await.clock.observe(clock);
        self.do_release().await;
        Ok(Ack)
    }

    /// Shared body of `on-receive RELEASE`: reset the vote slot and, if the
    /// queue is non-empty, grant it forward. Also invoked in-process by the
    /// rescind-ACK path (spec.md §9 open question #4) instead of a loopback
    /// RPC to self.
    async fn do_release(self: &Arc<Self>) {
        let head = {
            let mut inner = self.inner.lock().await;
            inner.votes_available = 1;
            inner.prev_vote = None;
            inner.queue.pop()
        };
        let Some((req_time, id)) = head else { return };
        let Some(addr) = self.peers.lock().await.addr_for(id) else {
            tracing::warn!(node = self.id, peer = id, "no known address for queued requester");
            return;
        };
        let clock = {
            let mut inner = self.inner.lock().await;
            inner.votes_available = 0;
            inner.prev_vote = Some((id, req_time));
            inner.clock.tick()
        };
        let message = Message::Vote {
            sender_id: self.id,
            sender_addr: self.addr,
            clock,
        };
        info!(node = self.id, peer = id, "sending a vote");
        if let Err(err) = wire::call::<_, Ack>(addr, &message).await {
            tracing::warn!(node = self.id, peer = id, %err, "error occurred while sending a vote");
        }
    }

    /// `release-all`: return every outstanding granted vote.
    async fn release_all(self: &Arc<Self>) {
        let granters: Vec<u32> = self.inner.lock().await.votes_received.drain().collect();
        for id in granters {
            let Some(addr) = self.peers.lock().await.addr_for(id) else {
                continue;
            };
            let clock = self.inner.lock().await.clock.tick();
            let message = Message::Release {
                sender_id: self.id,
                clock,
            };
            info!(node = self.id, peer = id, "sending a release");
            if let Err(err) = wire::call::<_, Ack>(addr, &message).await {
                tracing::warn!(node = self.id, peer = id, %err, "error occurred while sending a release");
            }
        }
    }

    /// `on-receive RESCIND-VOTE`: deny if already finished or if we do not
    /// hold that granter's vote; otherwise release it and acknowledge.
    pub async fn on_receive_rescind_vote(self: &Arc<Self>, msg: Message) -> anyhow::Result<RescindReply> {
        let Message::RescindVote { sender_id, clock, .. } = msg else {
            anyhow::bail!("on_receive_rescind_vote called with a non-RescindVote message")
        };
        let mut inner = self.inner.lock().await;
        inner.clock.observe(clock);
        info!(node = self.id, peer = sender_id, "received a rescind vote");
        if inner.finished {
            return Ok(RescindReply::Deny);
        }
        if !inner.votes_received.remove(&sender_id) {
            return Ok(RescindReply::Deny);
        }
        Ok(RescindReply::Ack)
    }
}

async fn critical_section(id: u32) {
    info!(node = id, "entering the critical section");
    tokio::time::sleep(CS_DELAY).await;
    info!(node = id, "completed the critical section");
}

async fn notify_bootstrap(id: u32) {
    let message = Message::NotifyFinished { id };
    if let Err(err) = wire::call::<_, Ack>(bootstrap_addr(), &message).await {
        tracing::warn!(node = id, %err, "error occurred while notifying the bootstrap node");
    }
}

/// Join protocol: tell every already-known peer about this node, the way
/// `original_source/Voting-Protocol/main.go`'s join loop calls `Node.AddNode`
/// on each entry of the roster it read.
pub async fn join(roster: &Membership, id: u32, own_addr: SocketAddr) {
    let message = Message::AddNode { id, addr: own_addr };
    for (peer_id, addr) in roster.peers_excluding(id) {
        if let Err(err) = wire::call::<_, Ack>(addr, &message).await {
            tracing::warn!(node = id, peer = peer_id, %err, "error occurred while adding node to the network");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn majority_threshold_matches_scenario_5() {
        // spec.md §8 scenario 5: N=3 gives threshold=2
        assert_eq!(majority_threshold(3), 2);
        assert_eq!(majority_threshold(5), 3);
        assert_eq!(majority_threshold(4), 3);
    }

    fn node(id: u32) -> Arc<Node> {
        Arc::new(Node::new(
            id,
            format!("127.0.0.1:{}", 19000 + id).parse().unwrap(),
            Membership::default(),
        ))
    }

    #[tokio::test]
    async fn first_request_is_granted_immediately() {
        let n = node(0);
        let votes_available_before = n.inner.lock().await.votes_available;
        assert_eq!(votes_available_before, 1);
    }

    #[tokio::test]
    async fn rescind_is_triggered_by_a_strictly_higher_priority_request() {
        let n = node(0);
        {
            let mut inner = n.inner.lock().await;
            inner.votes_available = 0;
            inner.prev_vote = Some((2, 5)); // backing node 2's request at t=5
        }
        let inner = n.inner.lock().await;
        let (prev_id, prev_req_time) = inner.prev_vote.unwrap();
        // node 1 requesting at t=3: (3,1) < (5,2) lexicographically -> rescind
        assert!((3i64, 1u32) < (prev_req_time, prev_id));
    }

    #[tokio::test]
    async fn release_grants_to_queue_head_in_priority_order() {
        let n = node(0);
        {
            let mut inner = n.inner.lock().await;
            inner.votes_available = 0;
            inner.prev_vote = Some((9, 100));
            inner.queue.push((5, 2));
            inner.queue.push((3, 1));
        }
        n.peers.lock().await.insert(1, "127.0.0.1:19101".parse().unwrap());
        n.peers.lock().await.insert(2, "127.0.0.1:19102".parse().unwrap());
        n.do_release().await;
        let inner = n.inner.lock().await;
        assert_eq!(inner.prev_vote, Some((1, 3)));
        assert_eq!(inner.queue.peek(), Some((5, 2)));
    }
}
