use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::protocol::MAX_PACKET_SIZE;
use super::stats::{NetworkStats, StatsCounters};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub trait Transport: Send + Sync {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

pub trait DatagramHandler: Send + Sync {
    fn on_receive(&self, from: SocketAddr, bytes: &[u8]);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        (**self).send_to(bytes, addr)
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: StatsCounters,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        // Listener threads wake up periodically to observe shutdown.
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: StatsCounters::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.snapshot()
    }

    /// Returns `None` when the read timed out without a datagram.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((size, addr)) => {
                self.stats.record_received(size);
                Ok(Some((size, addr)))
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn spawn_listeners(
        self: &Arc<Self>,
        threads: usize,
        handler: Arc<dyn DatagramHandler>,
        running: Arc<AtomicBool>,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        (0..threads.max(1))
            .map(|index| {
                let transport = Arc::clone(self);
                let handler = Arc::clone(&handler);
                let running = Arc::clone(&running);
                thread::Builder::new()
                    .name(format!("courier-io-{}", index))
                    .spawn(move || transport.listen(handler.as_ref(), &running))
            })
            .collect()
    }

    fn listen(&self, handler: &dyn DatagramHandler, running: &AtomicBool) {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        while running.load(Ordering::SeqCst) {
            match self.recv_from(&mut buffer) {
                Ok(Some((size, addr))) => handler.on_receive(addr, &buffer[..size]),
                Ok(None) => {}
                // ICMP port-unreachable surfaces as a reset on some platforms.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    log::debug!("Ignoring connection reset on {}", self.local_addr);
                }
                Err(e) => {
                    log::warn!("Receive error on {}: {}", self.local_addr, e);
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }

        log::debug!("Listener on {} stopped", self.local_addr);
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, bytes: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Packet exceeds MTU",
            ));
        }

        let sent = self.socket.send_to(bytes, addr)?;
        self.stats.record_sent(sent);
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct Collector {
        received: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl DatagramHandler for Collector {
        fn on_receive(&self, from: SocketAddr, bytes: &[u8]) {
            self.received.lock().unwrap().push((from, bytes.to_vec()));
        }
    }

    #[test]
    fn listeners_deliver_datagrams() {
        let server = Arc::new(UdpTransport::bind("127.0.0.1:0").unwrap());
        let client = UdpTransport::bind("127.0.0.1:0").unwrap();
        let collector = Arc::new(Collector::default());
        let running = Arc::new(AtomicBool::new(true));

        let workers = server
            .spawn_listeners(2, collector.clone(), running.clone())
            .unwrap();

        client.send_to(b"ping", server.local_addr()).unwrap();

        let start = Instant::now();
        while collector.received.lock().unwrap().is_empty()
            && start.elapsed() < Duration::from_secs(2)
        {
            thread::sleep(Duration::from_millis(5));
        }

        running.store(false, Ordering::SeqCst);
        for worker in workers {
            worker.join().unwrap();
        }

        let received = collector.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, client.local_addr());
        assert_eq!(received[0].1, b"ping");
        assert_eq!(client.stats().packets_sent, 1);
        assert_eq!(server.stats().packets_received, 1);
    }

    #[test]
    fn oversized_send_is_rejected() {
        let transport = UdpTransport::bind("127.0.0.1:0").unwrap();
        let data = vec![0u8; MAX_PACKET_SIZE + 1];
        let err = transport.send_to(&data, transport.local_addr()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
