use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::registration::RegistrationError;
use crate::net::{ControlFrame, ControlMessage, is_newer};
use crate::session::Inbound;
use crate::sync::lock;

pub type ConnectionId = u32;

#[derive(Debug)]
pub struct DraftConnection {
    nonce: u64,
    slots: Box<[Option<SocketAddr>]>,
    created: Instant,
}

impl DraftConnection {
    pub fn new(nonce: u64, channels: usize, now: Instant) -> Self {
        Self {
            nonce,
            slots: vec![None; channels.max(1)].into_boxed_slice(),
            created: now,
        }
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// Binding a slot to the endpoint it already holds is a no-op; binding
    /// it to a different endpoint is a protocol violation.
    pub fn set_channel(
        &mut self,
        channel: u8,
        endpoint: SocketAddr,
    ) -> Result<(), RegistrationError> {
        let channels = self.slots.len();
        let slot = self
            .slots
            .get_mut(usize::from(channel))
            .ok_or(RegistrationError::ChannelOutOfRange { channel, channels })?;

        match *slot {
            Some(existing) if existing != endpoint => Err(RegistrationError::ChannelConflict {
                channel,
                existing,
                endpoint,
            }),
            _ => {
                *slot = Some(endpoint);
                Ok(())
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn has_endpoint(&self, endpoint: SocketAddr) -> bool {
        self.endpoints().any(|e| e == endpoint)
    }

    /// Hands back the filled slots, or the draft itself if any is empty.
    pub fn try_complete(self) -> Result<Box<[SocketAddr]>, Self> {
        if !self.is_complete() {
            return Err(self);
        }
        Ok(self.slots.iter().flatten().copied().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAcceptance {
    Stale,
    Accepted { confirmed: Option<ControlMessage> },
}

/// Strictly sequential retransmitting queue of control messages. Only the
/// head is ever on the wire; it stays there until confirmed.
#[derive(Debug, Default)]
pub struct ForceQueue {
    queue: VecDeque<ControlMessage>,
    resend_counter: u32,
    last_accepted: Option<u32>,
}

impl ForceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ControlMessage) {
        self.queue.push_back(message);
    }

    /// Drops everything queued in favour of `message`. An in-flight head
    /// gives up its order number so a late confirmation of it cannot
    /// confirm the replacement.
    pub fn replace(&mut self, message: ControlMessage) {
        if !self.queue.is_empty() {
            self.resend_counter = self.resend_counter.wrapping_add(1);
            self.queue.clear();
        }
        self.queue.push_back(message);
    }

    pub fn head_frame(&self) -> Option<ControlFrame> {
        self.queue
            .front()
            .map(|message| ControlFrame::new(self.resend_counter, message.clone(), true))
    }

    pub fn accept(&mut self, order_number: u32, confirm: bool) -> ControlAcceptance {
        if !is_newer(order_number, self.last_accepted) {
            return ControlAcceptance::Stale;
        }
        self.last_accepted = Some(order_number);

        let confirmed = if confirm && order_number == self.resend_counter {
            let head = self.queue.pop_front();
            if head.is_some() {
                self.resend_counter = self.resend_counter.wrapping_add(1);
            }
            head
        } else {
            None
        };

        ControlAcceptance::Accepted { confirmed }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

type Attribute = Arc<dyn Any + Send + Sync>;

pub struct Connection {
    id: ConnectionId,
    nonce: u64,
    endpoints: Box<[SocketAddr]>,
    attributes: Mutex<HashMap<String, Attribute>>,
    force_queue: Mutex<ForceQueue>,
    // Held for the duration of one dispatch.
    inbound: Mutex<Inbound>,
    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    send_sequence: AtomicU32,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(id: ConnectionId, nonce: u64, endpoints: Box<[SocketAddr]>, now: Instant) -> Self {
        Self {
            id,
            nonce,
            endpoints,
            attributes: Mutex::new(HashMap::new()),
            force_queue: Mutex::new(ForceQueue::new()),
            inbound: Mutex::new(Inbound::new()),
            last_received: Mutex::new(now),
            last_sent: Mutex::new(now),
            send_sequence: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn endpoints(&self) -> &[SocketAddr] {
        &self.endpoints
    }

    /// Where envelopes and control frames are sent: channel 0.
    pub fn address(&self) -> SocketAddr {
        self.endpoints[0]
    }

    pub fn has_endpoint(&self, endpoint: SocketAddr) -> bool {
        self.endpoints.contains(&endpoint)
    }

    pub fn set_attribute<V: Any + Send + Sync>(&self, name: impl Into<String>, value: V) {
        lock(&self.attributes).insert(name.into(), Arc::new(value));
    }

    pub fn attribute<V: Any + Clone>(&self, name: &str) -> Option<V> {
        lock(&self.attributes)
            .get(name)
            .and_then(|value| value.downcast_ref::<V>())
            .cloned()
    }

    pub fn remove_attribute(&self, name: &str) -> bool {
        lock(&self.attributes).remove(name).is_some()
    }

    pub fn attribute_names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.attributes).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn enqueue_control(&self, message: ControlMessage) {
        lock(&self.force_queue).push(message);
    }

    /// Asks the peer to go away. The connection is torn down once the peer
    /// confirms the kick, or by the liveness timeout if it never does.
    pub fn close(&self, reason: impl Into<String>) {
        lock(&self.force_queue).replace(ControlMessage::Kick {
            reason: reason.into(),
        });
    }

    pub fn pending_control(&self) -> usize {
        lock(&self.force_queue).len()
    }

    pub fn head_frame(&self) -> Option<ControlFrame> {
        lock(&self.force_queue).head_frame()
    }

    pub fn accept_control(&self, order_number: u32, confirm: bool) -> ControlAcceptance {
        lock(&self.force_queue).accept(order_number, confirm)
    }

    pub fn touch(&self, now: Instant) {
        let mut last = lock(&self.last_received);
        if now > *last {
            *last = now;
        }
    }

    pub fn last_received(&self) -> Instant {
        *lock(&self.last_received)
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_received()) > timeout
    }

    pub fn mark_sent(&self, now: Instant) {
        *lock(&self.last_sent) = now;
    }

    pub fn is_idle(&self, now: Instant, interval: Duration) -> bool {
        now.saturating_duration_since(*lock(&self.last_sent)) >= interval
    }

    pub fn lock_inbound(&self) -> MutexGuard<'_, Inbound> {
        lock(&self.inbound)
    }

    pub fn next_sequence(&self) -> u32 {
        self.send_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns true only for the first caller.
    pub(crate) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoints", &self.endpoints)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn draft_rejects_conflicting_slot() {
        let mut draft = DraftConnection::new(1, 2, Instant::now());
        draft.set_channel(0, addr(1000)).unwrap();
        draft.set_channel(0, addr(1000)).unwrap();

        let err = draft.set_channel(0, addr(1001)).unwrap_err();
        assert_eq!(
            err,
            RegistrationError::ChannelConflict {
                channel: 0,
                existing: addr(1000),
                endpoint: addr(1001),
            }
        );
        assert!(matches!(
            draft.set_channel(2, addr(1002)),
            Err(RegistrationError::ChannelOutOfRange { channel: 2, channels: 2 })
        ));
    }

    #[test]
    fn draft_completes_when_every_slot_is_filled() {
        let mut draft = DraftConnection::new(1, 2, Instant::now());
        draft.set_channel(1, addr(2001)).unwrap();
        assert!(!draft.is_complete());

        let mut draft = draft.try_complete().unwrap_err();
        draft.set_channel(0, addr(2000)).unwrap();

        let endpoints = draft.try_complete().unwrap();
        assert_eq!(&*endpoints, &[addr(2000), addr(2001)]);
    }

    #[test]
    fn force_queue_exposes_one_entry_at_a_time() {
        let mut queue = ForceQueue::new();
        queue.push(ControlMessage::Registered { id: 4 });
        queue.push(ControlMessage::ServicesReady);

        let frame = queue.head_frame().unwrap();
        assert_eq!(frame.order_number, 0);
        assert!(frame.confirms());
        assert_eq!(frame.message, ControlMessage::Registered { id: 4 });

        // Unconfirmed frames do not advance the queue.
        assert_eq!(
            queue.accept(0, false),
            ControlAcceptance::Accepted { confirmed: None }
        );
        assert_eq!(queue.len(), 2);

        assert_eq!(
            queue.accept(1, true),
            ControlAcceptance::Accepted { confirmed: None }
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn force_queue_pops_on_matching_confirmation() {
        let mut queue = ForceQueue::new();
        queue.push(ControlMessage::Registered { id: 4 });
        queue.push(ControlMessage::ServicesReady);

        assert_eq!(
            queue.accept(0, true),
            ControlAcceptance::Accepted {
                confirmed: Some(ControlMessage::Registered { id: 4 })
            }
        );
        assert_eq!(queue.accept(0, true), ControlAcceptance::Stale);

        let frame = queue.head_frame().unwrap();
        assert_eq!(frame.order_number, 1);
        assert_eq!(frame.message, ControlMessage::ServicesReady);

        queue.accept(1, true);
        assert!(queue.is_empty());
        assert!(queue.head_frame().is_none());
    }

    #[test]
    fn replacing_in_flight_head_retires_its_order_number() {
        let mut queue = ForceQueue::new();
        queue.push(ControlMessage::ServicesReady);
        queue.replace(ControlMessage::Kick {
            reason: "bye".to_string(),
        });

        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.accept(0, true),
            ControlAcceptance::Accepted { confirmed: None }
        );

        let frame = queue.head_frame().unwrap();
        assert_eq!(frame.order_number, 1);
        assert!(matches!(frame.message, ControlMessage::Kick { .. }));
    }

    #[test]
    fn attributes_are_typed() {
        let connection = Connection::new(1, 9, vec![addr(3000)].into_boxed_slice(), Instant::now());
        connection.set_attribute("name", "alice".to_string());
        connection.set_attribute("score", 42u32);

        assert_eq!(connection.attribute::<String>("name").as_deref(), Some("alice"));
        assert_eq!(connection.attribute::<u32>("score"), Some(42));
        assert_eq!(connection.attribute::<u64>("score"), None);
        assert_eq!(connection.attribute_names(), vec!["name", "score"]);

        assert!(connection.remove_attribute("name"));
        assert!(!connection.remove_attribute("name"));
    }

    #[test]
    fn liveness_tracks_last_receive() {
        let start = Instant::now();
        let connection = Connection::new(1, 9, vec![addr(3000)].into_boxed_slice(), start);
        let timeout = Duration::from_millis(2000);

        assert!(!connection.is_timed_out(start + Duration::from_millis(2000), timeout));
        assert!(connection.is_timed_out(start + Duration::from_millis(2001), timeout));

        connection.touch(start + Duration::from_millis(1500));
        assert!(!connection.is_timed_out(start + Duration::from_millis(3000), timeout));
    }

    #[test]
    fn mark_closed_only_once() {
        let connection = Connection::new(1, 9, vec![addr(3000)].into_boxed_slice(), Instant::now());
        assert!(connection.mark_closed());
        assert!(!connection.mark_closed());
        assert!(connection.is_closed());
    }
}
