use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use log::debug;
use rand::Rng;
use tokio::time::Instant;

use crate::msg::{Message, MessageId, MessageType, MAX_TOKEN_LENGTH};

/// Exchange key for message-layer matching: Confirmable/ACK/RST pairs and duplicate
/// detection.  Message IDs are only unique per peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Hash)]
pub struct MessageKey<Endpoint> {
    pub message_id: MessageId,
    pub peer: Endpoint,
}

impl<Endpoint: Clone> MessageKey<Endpoint> {
    pub fn new(message: &Message, peer: &Endpoint) -> Self {
        Self {
            message_id: message.header.message_id,
            peer: peer.clone(),
        }
    }
}

/// Request/response key: responses (and Observe notifications) are matched by token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Hash)]
pub struct TokenKey<Endpoint> {
    pub peer: Endpoint,
    pub token: Vec<u8>,
}

impl<Endpoint: Clone> TokenKey<Endpoint> {
    pub fn new(message: &Message, peer: &Endpoint) -> Self {
        Self {
            peer: peer.clone(),
            token: message.get_token().to_vec(),
        }
    }
}

/// Tracks outbound requests awaiting a response.  Tokens are random and never collide with a
/// token that is still pending on this matcher, regardless of peer.
pub struct TokenMatcher<Endpoint, V> {
    pending: HashMap<TokenKey<Endpoint>, V>,
    token_length: usize,
}

impl<Endpoint: Debug + Clone + Eq + Hash, V> TokenMatcher<Endpoint, V> {
    pub fn new(token_length: usize) -> Self {
        Self {
            pending: HashMap::new(),
            token_length: token_length.clamp(1, MAX_TOKEN_LENGTH),
        }
    }

    /// Generates a fresh token that is not currently in use.
    pub fn fresh_token(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        loop {
            let mut token = vec![0u8; self.token_length];
            rng.fill(&mut token[..]);
            if !self.pending.keys().any(|key| key.token == token) {
                return token;
            }
            debug!("Token collision on {token:?}, regenerating");
        }
    }

    /// Allocates a token and registers `value` under it in one step.
    pub fn register(&mut self, peer: &Endpoint, value: V) -> Vec<u8> {
        let token = self.fresh_token();
        self.pending.insert(
            TokenKey {
                peer: peer.clone(),
                token: token.clone(),
            },
            value,
        );
        token
    }

    /// Registers `value` under a token the caller already owns (e.g. to re-use an Observe
    /// token for its cancellation request).
    pub fn insert(&mut self, key: TokenKey<Endpoint>, value: V) -> Option<V> {
        self.pending.insert(key, value)
    }

    pub fn get(&self, key: &TokenKey<Endpoint>) -> Option<&V> {
        self.pending.get(key)
    }

    pub fn get_mut(&mut self, key: &TokenKey<Endpoint>) -> Option<&mut V> {
        self.pending.get_mut(key)
    }

    pub fn remove(&mut self, key: &TokenKey<Endpoint>) -> Option<V> {
        self.pending.remove(key)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (TokenKey<Endpoint>, V)> + '_ {
        self.pending.drain()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Outcome of looking up an inbound CON/NON in the deduplication table.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMatch {
    /// First time this (peer, message id) was seen.
    New,
    /// Duplicate of a message whose handler has not produced a reply yet.
    InProgress,
    /// Duplicate of an answered message; send the stored reply again.
    Replay(Message),
}

#[derive(Debug)]
struct InboundExchange {
    received_at: Instant,
    lifetime: Duration,
    reply: Option<Message>,
}

/// Inbound duplicate detection keyed by (peer, message id).  Entries live for
/// EXCHANGE_LIFETIME (CON) or NON_LIFETIME (NON) and are purged lazily.
pub struct DuplicateDetector<Endpoint> {
    exchanges: HashMap<MessageKey<Endpoint>, InboundExchange>,
    exchange_lifetime: Duration,
    non_lifetime: Duration,
}

impl<Endpoint: Debug + Clone + Eq + Hash> DuplicateDetector<Endpoint> {
    pub fn new(exchange_lifetime: Duration, non_lifetime: Duration) -> Self {
        Self {
            exchanges: HashMap::new(),
            exchange_lifetime,
            non_lifetime,
        }
    }

    pub fn match_inbound(&mut self, message: &Message, peer: &Endpoint) -> InboundMatch {
        let now = Instant::now();
        self.purge_expired(now);

        let lifetime = match message.header.get_type() {
            MessageType::Confirmable => self.exchange_lifetime,
            MessageType::NonConfirmable => self.non_lifetime,
            _ => return InboundMatch::New,
        };
        let key = MessageKey::new(message, peer);
        match self.exchanges.get(&key) {
            Some(InboundExchange {
                reply: Some(reply), ..
            }) => InboundMatch::Replay(reply.clone()),
            Some(_) => InboundMatch::InProgress,
            None => {
                self.exchanges.insert(
                    key,
                    InboundExchange {
                        received_at: now,
                        lifetime,
                        reply: None,
                    },
                );
                InboundMatch::New
            }
        }
    }

    /// Stores the reply that a later duplicate of `message_id` should be answered with.  For a
    /// separate response this is the empty ACK.
    pub fn record_reply(&mut self, peer: &Endpoint, message_id: MessageId, reply: Message) {
        let key = MessageKey {
            message_id,
            peer: peer.clone(),
        };
        if let Some(exchange) = self.exchanges.get_mut(&key) {
            exchange.reply = Some(reply);
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        self.exchanges
            .retain(|_, exchange| now.duration_since(exchange.received_at) < exchange.lifetime);
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
