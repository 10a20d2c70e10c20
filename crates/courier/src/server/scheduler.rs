use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::events::DisconnectReason;
use super::registration::ConnectionRegistry;
use crate::clock::Clock;
use crate::net::{Codec, Packet, PacketHeader, PacketType, Transport, send_packet};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub resent: usize,
    pub timed_out: usize,
    pub expired_drafts: usize,
}

/// Periodically resends each connection's in-flight control message and
/// closes connections that have gone silent.
pub struct RetransmitScheduler {
    registry: Arc<ConnectionRegistry>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    timeout: Duration,
}

impl RetransmitScheduler {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            codec,
            clock,
            interval,
            timeout,
        }
    }

    pub fn run_once(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for connection in self.registry.connections() {
            if connection.is_timed_out(now, self.timeout) {
                log::debug!("Client {} timed out", connection.id());
                if self.registry.close(connection.id(), DisconnectReason::Timeout) {
                    report.timed_out += 1;
                }
                continue;
            }

            let Some(frame) = connection.head_frame() else {
                continue;
            };

            let packet = Packet::new(
                PacketHeader::new(connection.next_sequence()),
                PacketType::Control(frame),
            );
            // A failed send is retried on the next sweep.
            match send_packet(
                self.transport.as_ref(),
                self.codec.as_ref(),
                &packet,
                connection.address(),
            ) {
                Ok(_) => report.resent += 1,
                Err(e) => log::warn!("Resend to client {} failed: {}", connection.id(), e),
            }
        }

        report.expired_drafts = self.registry.expire_pending(now, self.timeout);

        report
    }

    pub fn spawn(self: Arc<Self>, running: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("courier-scheduler".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let report = self.run_once();
                    if report.timed_out > 0 {
                        log::debug!("Sweep closed {} silent connections", report.timed_out);
                    }
                    thread::sleep(self.interval);
                }
                log::debug!("Scheduler stopped");
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::net::{ControlMessage, MemoryTransport, Registration, RkyvCodec};
    use crate::server::events::{EventQueue, ServerEvent};
    use crate::server::registration::RegistrationOutcome;
    use std::net::SocketAddr;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        transport: Arc<MemoryTransport>,
        clock: Arc<ManualClock>,
        events: Arc<EventQueue>,
        scheduler: RetransmitScheduler,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new("courier", 1, 1, 8));
        let transport = Arc::new(MemoryTransport::new());
        let clock = Arc::new(ManualClock::new());
        let events = Arc::new(EventQueue::new());
        registry.add_listener(events.clone());

        let scheduler = RetransmitScheduler::new(
            registry.clone(),
            transport.clone(),
            Arc::new(RkyvCodec),
            clock.clone(),
            Duration::from_millis(200),
            Duration::from_millis(2000),
        );

        Fixture {
            registry,
            transport,
            clock,
            events,
            scheduler,
        }
    }

    fn register(fixture: &Fixture, port: u16) -> SocketAddr {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let hello = Registration {
            nonce: u64::from(port),
            channel: 0,
            game_name: "courier".to_string(),
            version: 1,
        };
        let outcome = fixture
            .registry
            .register(addr, 0, &hello, fixture.clock.now())
            .unwrap();
        assert!(matches!(outcome, RegistrationOutcome::Completed(_)));
        addr
    }

    fn sent_frames(transport: &MemoryTransport) -> Vec<(SocketAddr, u32, ControlMessage)> {
        transport
            .take_sent()
            .into_iter()
            .map(|datagram| {
                let packet = RkyvCodec.decode(&datagram.bytes).unwrap();
                let PacketType::Control(frame) = packet.payload else {
                    panic!("expected control frame");
                };
                assert!(frame.confirms());
                (datagram.to, frame.order_number, frame.message)
            })
            .collect()
    }

    #[test]
    fn head_is_resent_until_confirmed() {
        let f = fixture();
        let addr = register(&f, 6000);

        f.scheduler.run_once();
        f.scheduler.run_once();
        assert_eq!(
            sent_frames(&f.transport),
            vec![
                (addr, 0, ControlMessage::Registered { id: 1 }),
                (addr, 0, ControlMessage::Registered { id: 1 }),
            ]
        );

        let connection = f.registry.connection(1).unwrap();
        connection.accept_control(0, true);

        f.scheduler.run_once();
        assert_eq!(
            sent_frames(&f.transport),
            vec![(addr, 1, ControlMessage::ServicesReady)]
        );

        connection.accept_control(1, true);
        let report = f.scheduler.run_once();
        assert_eq!(report.resent, 0);
        assert_eq!(f.transport.sent_len(), 0);
    }

    #[test]
    fn silent_connection_is_closed_once() {
        let f = fixture();
        register(&f, 6000);
        f.events.drain();

        f.clock.advance(Duration::from_millis(2000));
        assert_eq!(f.scheduler.run_once().timed_out, 0);

        f.clock.advance(Duration::from_millis(1));
        assert_eq!(f.scheduler.run_once().timed_out, 1);
        assert_eq!(f.scheduler.run_once().timed_out, 0);

        assert!(f.registry.is_empty());
        assert_eq!(
            f.events.drain(),
            vec![ServerEvent::ClientDisconnected {
                client_id: 1,
                reason: DisconnectReason::Timeout
            }]
        );
    }

    #[test]
    fn active_connection_survives() {
        let f = fixture();
        register(&f, 6000);
        let connection = f.registry.connection(1).unwrap();

        for _ in 0..20 {
            f.clock.advance(Duration::from_millis(200));
            connection.touch(f.clock.now());
            f.scheduler.run_once();
        }

        assert!(!connection.is_closed());
        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn one_silent_peer_does_not_affect_another() {
        let f = fixture();
        register(&f, 6000);
        f.clock.advance(Duration::from_millis(1500));
        register(&f, 6001);

        f.clock.advance(Duration::from_millis(600));
        let report = f.scheduler.run_once();

        assert_eq!(report.timed_out, 1);
        assert_eq!(report.resent, 1);
        assert!(f.registry.connection(1).is_none());
        assert!(f.registry.connection(2).is_some());
    }
}
