//! Message handling: routing-plane datagrams, data-plane stream lines and
//! the transaction lifecycle that ties replies back to whoever asked.

use crate::id::Id;
use crate::node::Node;
use crate::node::TimerKind;
use crate::node::Transaction;
use crate::ring::Route;
use crate::transport::ConnId;
use crate::wire::Packet;
use crate::wire::StreamMsg;

impl Node {
    pub(super) async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Find { hash, origin, trans } => {
                self.find_forward(hash, &origin, &trans).await;
            }
            Packet::Found { hash, owner, trans } => {
                self.handle_found(hash, &owner, &trans).await;
            }
            Packet::Getp { from } => {
                if let Some(prev) = self.ring.predecessor().map(str::to_string) {
                    self.send_packet(&from, Packet::Pred { prev }).await;
                }
            }
            Packet::Notify { from } => self.ring.on_notify(&from),
            Packet::Pred { prev } => self.ring.on_pred(&prev),
            Packet::Show { origin, trans } => {
                if origin == self.name {
                    // Our own roll call made it all the way around.
                    return;
                }
                let successor = self.ring.successor().map(str::to_string);
                let gossip = Packet::Show { origin: origin.clone(), trans: trans.clone() };
                self.send_packet_opt(successor.as_deref(), gossip).await;
                let reply = Packet::Peer { from: self.name.clone(), trans };
                self.send_packet(&origin, reply).await;
            }
            Packet::Peer { from, trans } => self.handle_peer(&from, &trans),
            Packet::Ping { from } => {
                self.send_packet(&from, Packet::Pong { from: self.name.clone() }).await;
            }
            Packet::Pong { from } => self.ring.note_pong(&from),
        }
    }

    /// Starts a lookup we originate; we treat ourselves like any other
    /// origin on the forwarding path.
    pub(super) async fn find(&mut self, hash: Id, trans: String) {
        let origin = self.name.clone();
        self.find_forward(hash, &origin, &trans).await;
    }

    /// One Chord hop: hand the query to the closest preceding finger, or
    /// resolve it to our successor when no finger precedes the key.
    async fn find_forward(&mut self, hash: Id, origin: &str, trans: &str) {
        match self.ring.route(hash) {
            Route::Forward(next) => {
                let find = Packet::Find {
                    hash,
                    origin: origin.to_string(),
                    trans: trans.to_string(),
                };
                self.send_packet(&next, find).await;
            }
            Route::Owner(owner) => {
                let found = Packet::Found { hash, owner, trans: trans.to_string() };
                self.send_packet(origin, found).await;
            }
        }
    }

    /// A lookup we originated resolved. What happens next depends on why
    /// we asked.
    async fn handle_found(&mut self, hash: Id, owner: &str, trans: &str) {
        let Some(transaction) = self.transactions.get(trans).cloned() else {
            tracing::debug!(%trans, %hash, %owner, "FOUND for unknown transaction, dropping");
            return;
        };
        match transaction {
            // The item lives at `owner`; fetch or store over TCP, which
            // also handles payloads bigger than a datagram.
            Transaction::Get { .. } => {
                let conn = self.connect(owner);
                conn.write_line(StreamMsg::Get { hash, trans: trans.to_string() }.encode());
            }
            Transaction::Put { payload, .. } => {
                let conn = self.connect(owner);
                conn.write_line(StreamMsg::Put { payload, trans: trans.to_string() }.encode());
            }
            Transaction::Finger { index } => {
                self.transactions.remove(trans);
                if owner == self.name {
                    // Never put ourselves in the finger table; we are the
                    // fallback for every route anyway.
                    return;
                }
                if index == 0 {
                    // A fresh successor owes us every item outside the arc
                    // between it and us. Asking for that whole complement
                    // means we never need to know our own predecessor.
                    let conn = self.connect(owner);
                    let retr = StreamMsg::Retr { low: Id::for_addr(owner), high: self.id };
                    conn.write_line(retr.encode());
                }
                let old = self.ring.set_finger(index, owner.to_string());
                if old.as_deref() != Some(owner) {
                    tracing::info!(index, old = ?old, new = %owner, "Updating finger");
                }
            }
            Transaction::Backup => {
                self.transactions.remove(trans);
                let old = self.ring.set_succ_succ(owner.to_string());
                if old.as_deref() != Some(owner) {
                    tracing::debug!(peer = %owner, "Updating successor's successor");
                }
            }
            Transaction::Prune => {
                self.transactions.remove(trans);
                if owner != self.name && self.items.remove(&hash).is_some() {
                    tracing::info!(%hash, "No longer responsible for item, pruning");
                }
            }
            // Roll calls are resolved by PEER packets via `handle_peer`, never by FOUND.
            Transaction::Show { .. } => {
                tracing::debug!(%trans, %hash, %owner, "FOUND for roll-call transaction, dropping");
            }
        }
    }

    fn handle_peer(&mut self, peer: &str, trans: &str) {
        match self.transactions.get(trans) {
            Some(Transaction::Show { client }) => {
                if let Some(handle) = self.conns.get(client) {
                    let reply = StreamMsg::ClientPeer {
                        hash: Id::for_addr(peer),
                        addr: peer.to_string(),
                    };
                    handle.write_line(reply.encode());
                }
            }
            _ => tracing::debug!(%trans, %peer, "PEER for unknown roll call, dropping"),
        }
    }

    pub(super) async fn handle_stream(&mut self, conn: ConnId, msg: StreamMsg) {
        match msg {
            StreamMsg::ClientGet { hash } => {
                let trans = self.next_trans_id();
                self.transactions.insert(trans.clone(), Transaction::Get { client: conn });
                self.find(hash, trans).await;
            }
            StreamMsg::ClientPut { payload } => {
                let hash = Id::for_item(&payload);
                let trans = self.next_trans_id();
                self.transactions
                    .insert(trans.clone(), Transaction::Put { client: conn, payload });
                self.find(hash, trans).await;
            }
            StreamMsg::ClientShow => self.start_roll_call(conn).await,
            StreamMsg::Get { hash, trans } => {
                let reply = match self.items.get(&hash) {
                    Some(payload) => StreamMsg::Data { payload: payload.clone(), trans },
                    None => StreamMsg::Error { reason: "data.not.found".to_string(), trans },
                };
                if let Some(handle) = self.conns.get(&conn) {
                    handle.write_line(reply.encode());
                    handle.close_when_done();
                }
            }
            StreamMsg::Data { payload, trans } => {
                self.resolve_client(&trans, StreamMsg::ClientData { payload });
            }
            StreamMsg::Error { reason, trans } => {
                self.resolve_client(&trans, StreamMsg::ClientError { reason });
            }
            StreamMsg::Put { payload, trans } => {
                let hash = Id::for_item(&payload);
                tracing::info!(%hash, "Storing item");
                self.items.insert(hash, payload);
                if let Some(handle) = self.conns.get(&conn) {
                    handle.write_line(StreamMsg::StoreOk { hash, trans }.encode());
                    handle.close_when_done();
                }
            }
            StreamMsg::StoreOk { hash, trans } => {
                self.resolve_client(&trans, StreamMsg::ClientOk { hash });
            }
            StreamMsg::Retr { low, high } => self.transfer_range(conn, low, high),
            StreamMsg::Xfer { hash, payload } => {
                tracing::debug!(%hash, "Receiving item from peer");
                self.items.insert(hash, payload);
            }
            other => {
                tracing::debug!(conn, verb = other.verb(), "Unexpected message on stream socket");
            }
        }
    }

    /// CSHOW: start a ring roll call. We answer for ourselves right away;
    /// the SHOW gossip brings everyone else's PEER replies back here until
    /// the expiry timer closes the window.
    async fn start_roll_call(&mut self, conn: ConnId) {
        let trans = self.next_trans_id();
        self.transactions.insert(trans.clone(), Transaction::Show { client: conn });
        self.schedule(self.intervals.show_timeout, TimerKind::ShowExpiry(trans.clone()));

        let successor = self.ring.successor().map(str::to_string);
        if successor.as_deref() != Some(self.name.as_str()) {
            // This can misfire right after a join, while the successor
            // still points at a node that no longer precedes us.
            let gossip = Packet::Show { origin: self.name.clone(), trans };
            self.send_packet_opt(successor.as_deref(), gossip).await;
        }
        if let Some(handle) = self.conns.get(&conn) {
            let own = StreamMsg::ClientPeer { hash: self.id, addr: self.name.clone() };
            handle.write_line(own.encode());
        }
    }

    /// Delivers the outcome of a remote GET/PUT to the operator socket
    /// that asked and finishes the transaction.
    fn resolve_client(&mut self, trans: &str, reply: StreamMsg) {
        match self.transactions.get(trans).and_then(Transaction::client) {
            Some(client) => {
                self.transactions.remove(trans);
                if let Some(handle) = self.conns.get(&client) {
                    handle.write_line(reply.encode());
                    handle.close_when_done();
                }
            }
            None => tracing::debug!(%trans, "Reply for unknown transaction, dropping"),
        }
    }

    /// RETR: hand the requesting peer a copy of every item in the asked
    /// range. Items are copied, never moved; stale copies simply fall out
    /// of routing relevance instead of risking loss mid-convergence.
    fn transfer_range(&self, conn: ConnId, low: Id, high: Id) {
        let Some(handle) = self.conns.get(&conn) else {
            return;
        };
        let span = low.distance_to(high);
        for (hash, payload) in &self.items {
            if low.distance_to(*hash) < span {
                tracing::info!(%hash, "Transferring item to peer");
                let xfer = StreamMsg::Xfer { hash: *hash, payload: payload.clone() };
                handle.write_line(xfer.encode());
            }
        }
        handle.close_when_done();
    }
}
