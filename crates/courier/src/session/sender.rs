use std::collections::VecDeque;
use std::mem;

use super::command::Command;
use super::envelope::{Batch, Envelope};
use super::peers::PeerSet;
use super::receiver::CommandHandler;
use crate::net::{MAX_PAYLOAD_SIZE, sequence_greater_than};

#[derive(Debug, Default)]
pub struct Outbound {
    guaranteed: Vec<Command>,
    unreliable: Vec<Command>,
    history: VecDeque<Batch>,
    next_order_number: u32,
    send_pending: bool,
}

impl Outbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        if command.is_guaranteed() {
            self.guaranteed.push(command);
        } else {
            self.unreliable.push(command);
        }
        self.send_pending = true;
    }

    /// Forces an envelope on the next flush even with nothing queued.
    pub fn keep_alive(&mut self) {
        self.send_pending = true;
    }

    /// Unacknowledged history keeps a peer pending so lost batches are
    /// replayed every tick until confirmed.
    pub fn is_send_pending(&self) -> bool {
        self.send_pending || !self.history.is_empty()
    }

    pub fn build_envelope(&mut self) -> Option<Envelope> {
        if !self.is_send_pending() {
            return None;
        }

        let order_number = self.next_order_number;

        if !self.guaranteed.is_empty() {
            self.history.push_back(Batch {
                batch_id: order_number,
                commands: mem::take(&mut self.guaranteed),
            });
        }

        let envelope = Envelope {
            order_number,
            guaranteed: self.history.iter().cloned().collect(),
            unreliable: mem::take(&mut self.unreliable),
        };

        self.send_pending = false;
        self.next_order_number = self.next_order_number.wrapping_add(1);

        Some(envelope)
    }

    /// Drops every batch up to and including `confirmed`. Returns how many
    /// were removed; stale or repeated acks remove nothing.
    pub fn confirm_until(&mut self, confirmed: u32) -> usize {
        let mut removed = 0;
        while self
            .history
            .front()
            .is_some_and(|batch| !sequence_greater_than(batch.batch_id, confirmed))
        {
            self.history.pop_front();
            removed += 1;
        }
        removed
    }

    pub fn unconfirmed_len(&self) -> usize {
        self.history.len()
    }
}

/// Batches enqueued commands into one envelope per peer per tick.
pub struct Sender<P: PeerSet> {
    peers: P,
}

impl<P: PeerSet> Sender<P> {
    pub fn new(peers: P) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &P {
        &self.peers
    }

    /// Returns false, dropping the command, when `peer` is not connected
    /// or the payload could never fit in a datagram.
    pub fn enqueue(&self, peer: P::Peer, command: Command) -> bool {
        if command.payload().len() > MAX_PAYLOAD_SIZE {
            log::warn!(
                "Dropping {} byte command for {:?}, limit is {}",
                command.payload().len(),
                peer,
                MAX_PAYLOAD_SIZE
            );
            return false;
        }
        self.peers
            .with_outbound(peer, |outbound| outbound.push(command))
            .is_some()
    }

    pub fn broadcast(&self, command: Command) -> usize {
        self.peers
            .peers()
            .into_iter()
            .filter(|&peer| self.enqueue(peer, command.clone()))
            .count()
    }

    pub fn flush(&self, peer: P::Peer) -> Option<Envelope> {
        self.peers
            .with_outbound(peer, Outbound::build_envelope)
            .flatten()
    }

    pub fn flush_all(&self) -> Vec<(P::Peer, Envelope)> {
        self.peers
            .peers()
            .into_iter()
            .filter_map(|peer| self.flush(peer).map(|envelope| (peer, envelope)))
            .collect()
    }

    pub fn keep_alive(&self, peer: P::Peer) -> bool {
        self.peers
            .with_outbound(peer, Outbound::keep_alive)
            .is_some()
    }

    pub fn on_ack(&self, peer: P::Peer, confirmed_order_number: u32) -> usize {
        let removed = self
            .peers
            .with_outbound(peer, |outbound| outbound.confirm_until(confirmed_order_number))
            .unwrap_or(0);
        if removed > 0 {
            log::trace!(
                "{:?} confirmed up to {}, {} batches released",
                peer,
                confirmed_order_number,
                removed
            );
        }
        removed
    }

    pub fn unconfirmed_len(&self, peer: P::Peer) -> usize {
        self.peers
            .with_outbound(peer, |outbound| outbound.unconfirmed_len())
            .unwrap_or(0)
    }
}

impl<P: PeerSet> CommandHandler<P::Peer> for Sender<P> {
    fn on_unreliable(&self, source: P::Peer, command: &Command) {
        if let Some(confirmed) = command.confirmed_order_number() {
            self.on_ack(source, confirmed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PeerMap, SinglePeer};

    fn c(n: u8) -> Command {
        Command::guaranteed(0, vec![n])
    }

    fn connected() -> Sender<SinglePeer> {
        let sender = Sender::new(SinglePeer::new());
        sender.peers().connect();
        sender
    }

    #[test]
    fn first_flush_carries_new_batch() {
        let sender = connected();
        sender.enqueue((), c(1));

        let envelope = sender.flush(()).unwrap();
        assert_eq!(envelope.order_number, 0);
        assert_eq!(
            envelope.guaranteed,
            vec![Batch {
                batch_id: 0,
                commands: vec![c(1)],
            }]
        );
        assert!(envelope.unreliable.is_empty());
    }

    #[test]
    fn unacknowledged_history_is_replayed() {
        let sender = connected();
        sender.enqueue((), c(1));
        let _lost = sender.flush(()).unwrap();

        sender.enqueue((), c(2));
        let envelope = sender.flush(()).unwrap();

        assert_eq!(envelope.order_number, 1);
        assert_eq!(envelope.batch_ids().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(envelope.guaranteed[0].commands, vec![c(1)]);
        assert_eq!(envelope.guaranteed[1].commands, vec![c(2)]);
    }

    #[test]
    fn cumulative_ack_clears_history() {
        let sender = connected();
        sender.enqueue((), c(1));
        sender.flush(());
        sender.enqueue((), c(2));
        sender.flush(());
        assert_eq!(sender.unconfirmed_len(()), 2);

        assert_eq!(sender.on_ack((), 1), 2);
        assert_eq!(sender.unconfirmed_len(()), 0);
    }

    #[test]
    fn repeated_and_older_acks_are_noops() {
        let sender = connected();
        for n in 0..3 {
            sender.enqueue((), c(n));
            sender.flush(());
        }

        assert_eq!(sender.on_ack((), 1), 2);
        assert_eq!(sender.on_ack((), 1), 0);
        assert_eq!(sender.on_ack((), 0), 0);
        assert_eq!(sender.unconfirmed_len(()), 1);
    }

    #[test]
    fn unreliable_commands_are_not_replayed() {
        let sender = connected();
        sender.enqueue((), Command::unreliable(5, vec![1]));
        let first = sender.flush(()).unwrap();
        assert_eq!(first.unreliable.len(), 1);

        assert!(sender.flush(()).is_none());

        sender.enqueue((), Command::unreliable(5, vec![2]));
        let second = sender.flush(()).unwrap();
        assert_eq!(second.order_number, 1);
        assert_eq!(second.unreliable, vec![Command::unreliable(5, vec![2])]);
    }

    #[test]
    fn pending_history_keeps_flushing_without_new_commands() {
        let sender = connected();
        sender.enqueue((), c(1));
        sender.flush(());

        let replay = sender.flush(()).unwrap();
        assert_eq!(replay.order_number, 1);
        assert_eq!(replay.batch_ids().collect::<Vec<_>>(), vec![0]);

        sender.on_ack((), 1);
        assert!(sender.flush(()).is_none());
    }

    #[test]
    fn nothing_pending_means_no_envelope_and_no_counter_advance() {
        let sender = connected();
        assert!(sender.flush(()).is_none());

        sender.enqueue((), c(1));
        assert_eq!(sender.flush(()).unwrap().order_number, 0);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let sender = connected();
        assert!(!sender.enqueue((), Command::guaranteed(0, vec![0; MAX_PAYLOAD_SIZE + 1])));
        assert!(sender.flush(()).is_none());
        assert_eq!(sender.unconfirmed_len(()), 0);

        assert!(sender.enqueue((), Command::guaranteed(0, vec![0; MAX_PAYLOAD_SIZE])));
    }

    #[test]
    fn keep_alive_sends_an_empty_envelope() {
        let sender = connected();
        assert!(sender.flush(()).is_none());

        assert!(sender.keep_alive(()));
        let envelope = sender.flush(()).unwrap();
        assert_eq!(envelope, Envelope::new(0));
        assert!(sender.flush(()).is_none());
    }

    #[test]
    fn enqueue_without_peer_is_noop() {
        let sender = Sender::new(SinglePeer::new());
        assert!(!sender.enqueue((), c(1)));
        assert!(sender.flush(()).is_none());
    }

    #[test]
    fn ack_command_routes_to_history() {
        let sender = connected();
        sender.enqueue((), c(1));
        sender.flush(());

        sender.on_unreliable((), &Command::ack(0));
        assert_eq!(sender.unconfirmed_len(()), 0);
    }

    #[test]
    fn peer_map_keeps_independent_counters() {
        let sender = Sender::new(PeerMap::<u32>::new());
        sender.peers().add(1);
        sender.peers().add(2);

        sender.enqueue(1, c(1));
        sender.flush(1);
        sender.enqueue(1, c(2));
        let to_first = sender.flush(1).unwrap();

        sender.enqueue(2, c(3));
        let to_second = sender.flush(2).unwrap();

        assert_eq!(to_first.order_number, 1);
        assert_eq!(to_second.order_number, 0);
        assert_eq!(to_second.batch_ids().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn broadcast_reaches_every_peer() {
        let sender = Sender::new(PeerMap::<u32>::new());
        sender.peers().add(1);
        sender.peers().add(2);

        assert_eq!(sender.broadcast(c(9)), 2);

        let mut flushed = sender.flush_all();
        flushed.sort_by_key(|(peer, _)| *peer);
        assert_eq!(flushed.len(), 2);
        for (_, envelope) in flushed {
            assert_eq!(envelope.guaranteed[0].commands, vec![c(9)]);
        }
    }
}
