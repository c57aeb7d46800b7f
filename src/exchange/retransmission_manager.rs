use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::{Deref, RangeInclusive};
use std::time::Duration;

use anyhow::anyhow;
use log::debug;
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::watch;
use tokio::time;

use crate::exchange::matcher::MessageKey;
use crate::msg::{Message, MessageId, MessageType};

/// Applies ack timeouts and retry policies for Confirmable messages that are sent through it.
/// Also owns the per-instance message id counter so that every outbound message, reliable or
/// not, draws from a single sequence.
pub struct RetransmissionManager<Endpoint> {
    next_message_id: MessageId,
    unacknowledged_messages: HashMap<MessageKey<Endpoint>, ReplyHandle>,
    parameters: TransmissionParameters,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransmissionParameters {
    ack_timeout: Duration,
    ack_random_factor: f32,
    max_retransmit: usize,
    max_latency: Duration,
}

struct ReplyHandle {
    reply_tx: watch::Sender<ReplyEvent>,
}

#[derive(Debug, Clone)]
enum ReplyEvent {
    None,
    PeerResponse(MessageType),
    Cancelled,
    InternalError(String),
}

impl<Endpoint: Debug + Clone + Eq + Hash> RetransmissionManager<Endpoint> {
    pub fn new(parameters: TransmissionParameters) -> Self {
        Self {
            next_message_id: rand::thread_rng().gen(),
            unacknowledged_messages: Default::default(),
            parameters,
        }
    }

    pub fn parameters(&self) -> &TransmissionParameters {
        &self.parameters
    }

    /// Allocates a message id for a message that is not sent reliably (NON responses and
    /// notifications).
    pub fn next_message_id(&mut self) -> MessageId {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        message_id
    }

    /// Attempts to handle either the Acknowledgement or Reset message that we expect as a reply
    /// to our Confirmable message send attempts.  Returns false if the message did not match
    /// any outstanding send.
    pub fn maybe_handle_reply(&mut self, message: &Message, peer: &Endpoint) -> bool {
        let mtype = message.header.get_type();
        match mtype {
            MessageType::Acknowledgement | MessageType::Reset => {}
            _ => return false,
        }
        let key = MessageKey::new(message, peer);
        match self.unacknowledged_messages.remove(&key) {
            Some(handle) => {
                let _ = handle.reply_tx.send(ReplyEvent::PeerResponse(mtype));
                true
            }
            None => false,
        }
    }

    /// Stops retransmitting a pending send, resolving its future with [`SendFailed::Cancelled`].
    pub fn cancel(&mut self, peer: &Endpoint, message_id: MessageId) -> bool {
        let key = MessageKey {
            message_id,
            peer: peer.clone(),
        };
        match self.unacknowledged_messages.remove(&key) {
            Some(handle) => {
                debug!("Cancelling retransmission of message ID {message_id} to {peer:?}");
                let _ = handle.reply_tx.send(ReplyEvent::Cancelled);
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.unacknowledged_messages.drain() {
            let _ = handle.reply_tx.send(ReplyEvent::Cancelled);
        }
    }

    pub fn is_pending(&self, peer: &Endpoint, message_id: MessageId) -> bool {
        self.unacknowledged_messages.contains_key(&MessageKey {
            message_id,
            peer: peer.clone(),
        })
    }

    /// Long running send operation that will handle all the timeout and retry logic internally.
    /// This design makes it trivial for each individual call to manage its own
    /// error behaviour without dealing with clumsy callbacks.
    ///
    /// Note that this method mutates the message that is to be sent to ensure it is Confirmable
    /// and has a fresh message ID.  This ensures that the method is infallible.
    pub fn send_reliably(
        &mut self,
        mut message: Message,
        peer: Endpoint,
        message_tx: UnboundedSender<(Message, Endpoint)>,
    ) -> SendReliably<Endpoint> {
        message.header.message_id = self.next_message_id();
        message.header.set_type(MessageType::Confirmable);

        let (reply_tx, reply_rx) = watch::channel(ReplyEvent::None);
        let key = MessageKey::new(&message, &peer);
        if let Some(existing_send) = self
            .unacknowledged_messages
            .insert(key.clone(), ReplyHandle { reply_tx })
        {
            let _ = existing_send.reply_tx.send(ReplyEvent::InternalError(format!(
                "Re-used message key {key:?} by another send!"
            )));
        }

        SendReliably {
            message,
            message_tx,
            peer,
            parameters: self.parameters,
            reply_rx,
        }
    }
}

/// Default values come from the
/// [CoAP RFC](https://datatracker.ietf.org/doc/html/rfc7252#section-4.8.2).
impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            max_latency: Duration::from_secs(100),
        }
    }
}

impl TransmissionParameters {
    pub fn new(
        ack_timeout: Duration,
        ack_random_factor: f32,
        max_retransmit: usize,
    ) -> anyhow::Result<Self> {
        if ack_random_factor < 1.0 {
            return Err(anyhow!("Invalid ack_random_factor={ack_random_factor}"));
        }
        if ack_timeout.is_zero() {
            return Err(anyhow!("Invalid ack_timeout={ack_timeout:?}"));
        }
        if max_retransmit > 20 {
            return Err(anyhow!("Invalid max_retransmit={max_retransmit}"));
        }
        Ok(Self {
            ack_timeout,
            ack_random_factor,
            max_retransmit,
            ..Default::default()
        })
    }

    pub fn with_max_latency(mut self, max_latency: Duration) -> Self {
        self.max_latency = max_latency;
        self
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn max_retransmit(&self) -> usize {
        self.max_retransmit
    }

    pub fn ack_timeout_range(&self) -> RangeInclusive<Duration> {
        let timeout_low = self.ack_timeout;
        if self.ack_random_factor != 1.0 {
            let timeout_high = timeout_low.mul_f32(self.ack_random_factor);
            timeout_low..=timeout_high
        } else {
            timeout_low..=timeout_low
        }
    }

    /// `ACK_TIMEOUT * (2^MAX_RETRANSMIT - 1) * ACK_RANDOM_FACTOR`
    pub fn max_transmit_span(&self) -> Duration {
        let backoff = (1u32 << self.max_retransmit) - 1;
        (self.ack_timeout * backoff).mul_f32(self.ack_random_factor)
    }

    /// `ACK_TIMEOUT * (2^(MAX_RETRANSMIT + 1) - 1) * ACK_RANDOM_FACTOR`, the longest a sender
    /// may wait for any reply to a Confirmable request.
    pub fn max_transmit_wait(&self) -> Duration {
        let backoff = (1u32 << (self.max_retransmit + 1)) - 1;
        (self.ack_timeout * backoff).mul_f32(self.ack_random_factor)
    }

    /// Time from the first transmission of a CON until its sender gives up accepting an ACK.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency * 2 + self.ack_timeout
    }

    /// Time a NON message id must not be reused for.
    pub fn non_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency
    }
}

#[must_use = "don't forget to call into_future() and await it!"]
pub struct SendReliably<Endpoint> {
    message: Message,
    peer: Endpoint,
    message_tx: UnboundedSender<(Message, Endpoint)>,
    parameters: TransmissionParameters,
    reply_rx: watch::Receiver<ReplyEvent>,
}

impl<Endpoint: Debug + Clone> SendReliably<Endpoint> {
    pub fn get_message_id(&self) -> MessageId {
        self.message.header.message_id
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub async fn into_future(self) -> Result<(), SendFailed> {
        let mut next_timeout = rand::thread_rng().gen_range(self.parameters.ack_timeout_range());
        for attempt in 0..=self.parameters.max_retransmit {
            if attempt > 0 {
                let message_id = self.message.header.message_id;
                let peer = &self.peer;
                debug!("Attempting retransmission #{attempt} of message ID {message_id} to {peer:?}");
            }
            self.message_tx
                .send((self.message.clone(), self.peer.clone()))
                .map_err(|e| SendFailed::TransmissionError(anyhow!("{e}")))?;
            let curr_timeout = next_timeout;
            next_timeout *= 2;

            let mut reply_rx = self.reply_rx.clone();
            let timeout = time::sleep(curr_timeout);
            tokio::pin!(timeout);
            loop {
                tokio::select! {
                    changed = reply_rx.changed() => {
                        if changed.is_err() {
                            // Manager dropped along with the handle.
                            return Err(SendFailed::Cancelled);
                        }
                        match reply_rx.borrow().deref() {
                            ReplyEvent::None => {}
                            ReplyEvent::PeerResponse(MessageType::Acknowledgement) => return Ok(()),
                            ReplyEvent::PeerResponse(MessageType::Reset) => {
                                return Err(SendFailed::Reset);
                            }
                            ReplyEvent::PeerResponse(t) => {
                                return Err(SendFailed::InternalError(format!("unexpected t={t:?}")));
                            }
                            ReplyEvent::Cancelled => return Err(SendFailed::Cancelled),
                            ReplyEvent::InternalError(e) => {
                                return Err(SendFailed::InternalError(e.to_owned()));
                            }
                        }
                    }
                    _ = &mut timeout => break,
                }
            }
        }
        Err(SendFailed::NoReply(self.parameters.max_retransmit + 1))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SendFailed {
    #[error("no remote reply after {0} attempts")]
    NoReply(usize),

    #[error("reset message received")]
    Reset,

    #[error("send cancelled")]
    Cancelled,

    #[error(transparent)]
    TransmissionError(#[from] anyhow::Error),

    #[error("internal error: {0}")]
    InternalError(String),
}
