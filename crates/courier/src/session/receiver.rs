use std::sync::{Arc, RwLock};

use super::command::Command;
use super::envelope::Envelope;
use crate::net::is_newer;
use crate::sync::{read, write};

/// Application callback for delivered commands.
///
/// `S` identifies where a command came from: the connection id on a
/// server, `()` on a client.
pub trait CommandHandler<S>: Send + Sync {
    /// Called exactly once per guaranteed command, in send order.
    fn on_guaranteed(&self, _source: S, _command: &Command) {}

    /// Called for every unreliable command that arrives in a fresh
    /// envelope, acks included.
    fn on_unreliable(&self, _source: S, _command: &Command) {}
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Inbound {
    watermark: Option<u32>,
}

impl Inbound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self) -> Option<u32> {
        self.watermark
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    Stale,
    Accepted { delivered: usize, acked: bool },
}

type AckSink<S> = Box<dyn Fn(S, Command) + Send + Sync>;

pub struct Receiver<S> {
    handlers: RwLock<Vec<Arc<dyn CommandHandler<S>>>>,
    ack_sink: AckSink<S>,
}

impl<S: Copy> Receiver<S> {
    /// `ack_sink` gets the cumulative ack for every envelope that carried
    /// guaranteed batches; it is expected to enqueue it unreliably back to
    /// the source.
    pub fn new(ack_sink: impl Fn(S, Command) + Send + Sync + 'static) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            ack_sink: Box::new(ack_sink),
        }
    }

    pub fn register_handler(&self, handler: Arc<dyn CommandHandler<S>>) {
        write(&self.handlers).push(handler);
    }

    pub fn unregister_handler(&self, handler: &Arc<dyn CommandHandler<S>>) -> bool {
        let target = Arc::as_ptr(handler) as *const ();
        let mut handlers = write(&self.handlers);
        let before = handlers.len();
        handlers.retain(|h| Arc::as_ptr(h) as *const () != target);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        read(&self.handlers).len()
    }

    /// Applies one envelope from `source`. The caller must hold exclusive
    /// access to `inbound` for the whole call so envelopes from one peer
    /// are processed one at a time.
    pub fn on_envelope(
        &self,
        source: S,
        inbound: &mut Inbound,
        envelope: &Envelope,
    ) -> EnvelopeOutcome {
        if !is_newer(envelope.order_number, inbound.watermark) {
            log::trace!(
                "Discarding stale envelope {} (watermark {:?})",
                envelope.order_number,
                inbound.watermark
            );
            return EnvelopeOutcome::Stale;
        }

        // Handlers registered mid-delivery see the next envelope.
        let handlers: Vec<_> = read(&self.handlers).iter().cloned().collect();
        let mut delivered = 0;

        for batch in envelope
            .guaranteed
            .iter()
            .filter(|batch| is_newer(batch.batch_id, inbound.watermark))
        {
            for command in &batch.commands {
                for handler in &handlers {
                    handler.on_guaranteed(source, command);
                }
                delivered += 1;
            }
        }

        inbound.watermark = Some(envelope.order_number);

        let acked = !envelope.guaranteed.is_empty();
        if acked {
            (self.ack_sink)(source, Command::ack(envelope.order_number));
        }

        for command in &envelope.unreliable {
            for handler in &handlers {
                handler.on_unreliable(source, command);
            }
            delivered += 1;
        }

        EnvelopeOutcome::Accepted { delivered, acked }
    }
}
