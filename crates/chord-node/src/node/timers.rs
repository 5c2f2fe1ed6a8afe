//! The periodic maintenance work. Every handler re-arms its own timer, so
//! there is exactly one of each in flight at any time.

use crate::id::Id;
use crate::id::ID_BITS;
use crate::node::Node;
use crate::node::TimerKind;
use crate::node::Transaction;
use crate::wire::Packet;
use anyhow::bail;
use anyhow::Result;
use rand::Rng;

impl Node {
    pub(super) async fn on_timer(&mut self, kind: TimerKind) -> Result<()> {
        match kind {
            TimerKind::Stabilize => {
                self.schedule(self.intervals.stabilize, TimerKind::Stabilize);
                self.stabilize().await;
            }
            TimerKind::FixFinger => {
                self.schedule(self.intervals.fix_finger, TimerKind::FixFinger);
                self.fix_finger().await;
            }
            TimerKind::Backup => {
                self.schedule(self.intervals.backup, TimerKind::Backup);
                self.refresh_backup().await?;
            }
            TimerKind::Ping => {
                self.schedule(self.intervals.ping, TimerKind::Ping);
                self.ping_round().await;
            }
            TimerKind::ShowExpiry(trans) => self.expire_show(&trans),
        }
        Ok(())
    }

    /// Ask the successor who precedes it, and tell it about us. Chord
    /// notifies only after learning the reply, but a successor with no
    /// predecessor set never answers GETP at all, so we notify
    /// unconditionally.
    async fn stabilize(&mut self) {
        let successor = match self.ring.successor() {
            Some(successor) => successor.to_string(),
            None => return,
        };
        self.send_packet(&successor, Packet::Getp { from: self.name.clone() }).await;
        self.send_packet(&successor, Packet::Notify { from: self.name.clone() }).await;
    }

    /// Refresh one random high finger. Only the top eight indexes are
    /// worth maintaining at any realistic ring size.
    async fn fix_finger(&mut self) {
        let index = rand::thread_rng().gen_range(ID_BITS - 8..ID_BITS);
        let trans = self.next_trans_id();
        self.transactions.insert(trans.clone(), Transaction::Finger { index });
        let target = self.id.wrapping_add(Id::pow2(index));
        self.find(target, trans).await;
    }

    /// Keep a spare successor on hand. Losing both the successor and the
    /// spare means we can no longer reach the ring at all; crashing beats
    /// wedging silently.
    async fn refresh_backup(&mut self) -> Result<()> {
        if self.ring.successor().is_none() {
            match self.ring.promote_succ_succ() {
                Some(promoted) => {
                    tracing::info!(peer = %promoted, "Successor empty, promoting its successor");
                }
                None => bail!("lost successor and successor's successor"),
            }
        }
        if let Some(successor) = self.ring.successor().map(str::to_string) {
            let trans = self.next_trans_id();
            self.transactions.insert(trans.clone(), Transaction::Backup);
            let target = Id::for_addr(&successor).wrapping_add(Id::from_u64(1));
            self.find(target, trans).await;
        }
        Ok(())
    }

    /// Evict peers that missed two rounds, then ping everything we route
    /// through. Dead nodes are only ever detected here, by silence.
    async fn ping_round(&mut self) {
        self.ring.evict_dead();
        for peer in self.ring.rotate_ping_counters() {
            self.send_packet(&peer, Packet::Ping { from: self.name.clone() }).await;
        }
    }

    /// The roll-call window closed: drop the transaction and let go of the
    /// operator. Timers for transactions that died early fire into the
    /// void, which is fine.
    fn expire_show(&mut self, trans: &str) {
        let client = match self.transactions.get(trans) {
            Some(Transaction::Show { client }) => *client,
            _ => return,
        };
        tracing::debug!(%trans, "Roll call finished, closing operator connection");
        self.transactions.remove(trans);
        if let Some(handle) = self.conns.get(&client) {
            handle.close_when_done();
        }
    }
}
