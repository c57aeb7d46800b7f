use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::app::{CoapError, Request};
use crate::exchange::TokenKey;
use crate::msg::{MessageId, MessageType};

/// After this many consecutive Non-confirmable notifications the next one is sent
/// Confirmable, to find out whether the observer is still there (RFC 7641 §4.5).
pub const MAX_NON_NOTIFICATIONS: usize = 10;

/// Conditional notification parameters parsed from the registering request's query string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyConditions {
    /// Minimum time between two notifications.
    pub pmin: Option<Duration>,
    /// Maximum time without a notification.
    pub pmax: Option<Duration>,
    /// Any other condition keys, kept for resources that want to interpret them.
    pub extra: BTreeMap<String, String>,
}

impl NotifyConditions {
    pub fn from_queries(queries: &HashMap<String, String>) -> Result<Self, CoapError> {
        let mut conditions = Self::default();
        for (key, value) in queries {
            match key.as_str() {
                "pmin" => conditions.pmin = Some(parse_seconds(key, value)?),
                "pmax" => conditions.pmax = Some(parse_seconds(key, value)?),
                _ => {
                    conditions.extra.insert(key.clone(), value.clone());
                }
            }
        }
        if let (Some(pmin), Some(pmax)) = (conditions.pmin, conditions.pmax) {
            if pmax < pmin {
                return Err(CoapError::bad_request("pmax must not be less than pmin"));
            }
        }
        Ok(conditions)
    }

    /// Delay of the fallback notification timer: `(pmax - pmin) / 2`.
    pub fn fallback_interval(&self) -> Option<Duration> {
        let pmax = self.pmax?;
        let pmin = self.pmin.unwrap_or_default();
        let interval = pmax.saturating_sub(pmin) / 2;
        Some(interval.max(Duration::from_secs(1)))
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration, CoapError> {
    value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| CoapError::bad_request(format!("Invalid {key}={value}")))
}

/// One observer of one resource.
#[derive(Debug, Clone)]
pub struct ObserveRelation<Endpoint> {
    pub key: TokenKey<Endpoint>,
    pub resource_path: String,
    /// Registering request, replayed to render every notification.
    pub request: Request<Endpoint>,
    pub conditions: NotifyConditions,
    pub last_sequence: u32,
    pub last_notify: Option<Instant>,
    pub non_notifications: usize,
    /// Message id of the most recent notification, used to match a Reset.
    pub last_message_id: Option<MessageId>,
    /// Message id of a Confirmable notification that is still being retransmitted.
    pub in_flight: Option<MessageId>,
    /// Replaced on every notification so that stale timers can recognize themselves.  Unique
    /// across the manager.
    pub generation: u64,
}

/// A notification the dispatcher must render and send.
#[derive(Debug, Clone)]
pub struct PendingNotification<Endpoint> {
    pub key: TokenKey<Endpoint>,
    pub request: Request<Endpoint>,
    pub sequence: u32,
    pub confirmable: bool,
    /// In-flight Confirmable notification that this one supersedes.
    pub replaces: Option<MessageId>,
    pub generation: u64,
    pub fallback: Option<Duration>,
}

/// A notification held back by pmin.  The dispatcher re-checks the relation once `delay` has
/// passed; if nothing was sent in the meantime the latest state goes out then.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredNotification<Endpoint> {
    pub key: TokenKey<Endpoint>,
    pub generation: u64,
    pub delay: Duration,
}

/// Table of observe relations keyed by (peer, token).  At most one relation exists per key;
/// re-registering replaces the previous relation.
pub struct ObserveManager<Endpoint> {
    relations: HashMap<TokenKey<Endpoint>, ObserveRelation<Endpoint>>,
    max_non_notifications: usize,
    next_generation: u64,
}

impl<Endpoint: Debug + Clone + Eq + Hash> ObserveManager<Endpoint> {
    pub fn new(max_non_notifications: usize) -> Self {
        Self {
            relations: HashMap::new(),
            max_non_notifications,
            next_generation: 0,
        }
    }

    /// Registers (or refreshes) the relation for the request's (peer, token).  Returns the
    /// relation generation for arming the fallback timer, and whether a relation was replaced.
    pub fn register(
        &mut self,
        request: &Request<Endpoint>,
        resource_path: &str,
        sequence: u32,
        conditions: NotifyConditions,
    ) -> (u64, bool) {
        let key = TokenKey::new(&request.original, &request.source);
        let previous = self.relations.remove(&key);
        let generation = self.next_generation;
        self.next_generation += 1;
        debug!(
            "Observe registration from {:?} on /{resource_path} (token {:?})",
            key.peer, key.token
        );
        self.relations.insert(
            key.clone(),
            ObserveRelation {
                key,
                resource_path: resource_path.to_string(),
                request: request.clone(),
                conditions,
                last_sequence: sequence,
                // The registration response counts as the first notification.
                last_notify: Some(Instant::now()),
                non_notifications: 0,
                last_message_id: None,
                in_flight: previous.as_ref().and_then(|r| r.in_flight),
                generation,
            },
        );
        (generation, previous.is_some())
    }

    pub fn deregister(&mut self, key: &TokenKey<Endpoint>) -> Option<ObserveRelation<Endpoint>> {
        let removed = self.relations.remove(key);
        if removed.is_some() {
            debug!("Observe relation {key:?} removed");
        }
        removed
    }

    pub fn get(&self, key: &TokenKey<Endpoint>) -> Option<&ObserveRelation<Endpoint>> {
        self.relations.get(key)
    }

    /// Whether a timer armed for `generation` is still current.
    pub fn is_current(&self, key: &TokenKey<Endpoint>, generation: u64) -> bool {
        self.relations
            .get(key)
            .map_or(false, |r| r.generation == generation)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn has_relations(&self, resource_path: &str) -> bool {
        self.relations
            .values()
            .any(|r| r.resource_path == resource_path)
    }

    /// Implicit cancellation: the peer answered notification `message_id` with a Reset.
    pub fn on_reset(
        &mut self,
        peer: &Endpoint,
        message_id: MessageId,
    ) -> Option<ObserveRelation<Endpoint>> {
        let key = self
            .relations
            .values()
            .find(|r| &r.key.peer == peer && r.last_message_id == Some(message_id))
            .map(|r| r.key.clone())?;
        debug!("Reset from {peer:?} cancels observe relation {key:?}");
        self.relations.remove(&key)
    }

    /// Removes every relation on `resource_path` (resource deleted or no longer observable).
    pub fn remove_for_path(&mut self, resource_path: &str) -> Vec<ObserveRelation<Endpoint>> {
        let keys: Vec<_> = self
            .relations
            .values()
            .filter(|r| r.resource_path == resource_path)
            .map(|r| r.key.clone())
            .collect();
        keys.iter()
            .filter_map(|key| self.relations.remove(key))
            .collect()
    }

    /// Decides which relations on `resource_path` get a notification for `sequence`.  Relations
    /// still inside their pmin window are deferred until the window closes.
    pub fn prepare_notifications(
        &mut self,
        resource_path: &str,
        sequence: u32,
        now: Instant,
    ) -> (Vec<PendingNotification<Endpoint>>, Vec<DeferredNotification<Endpoint>>) {
        let max_non = self.max_non_notifications;
        let next_generation = &mut self.next_generation;
        let mut pending = Vec::new();
        let mut deferred = Vec::new();
        for relation in self
            .relations
            .values_mut()
            .filter(|r| r.resource_path == resource_path)
        {
            if let (Some(pmin), Some(last)) = (relation.conditions.pmin, relation.last_notify) {
                let elapsed = now.duration_since(last);
                if elapsed < pmin {
                    debug!("Notification for {:?} suppressed by pmin", relation.key);
                    deferred.push(DeferredNotification {
                        key: relation.key.clone(),
                        generation: relation.generation,
                        delay: pmin - elapsed,
                    });
                    continue;
                }
            }
            pending.push(Self::stamp(relation, sequence, now, max_non, next_generation));
        }
        (pending, deferred)
    }

    /// Fallback (pmax) or deferred (pmin) notification for one relation.  Returns `None` if
    /// the relation is gone or has been notified since the timer was armed.
    pub fn prepare_fallback(
        &mut self,
        key: &TokenKey<Endpoint>,
        generation: u64,
        sequence: u32,
        now: Instant,
    ) -> Option<PendingNotification<Endpoint>> {
        let max_non = self.max_non_notifications;
        let relation = self.relations.get_mut(key)?;
        if relation.generation != generation {
            return None;
        }
        Some(Self::stamp(relation, sequence, now, max_non, &mut self.next_generation))
    }

    fn stamp(
        relation: &mut ObserveRelation<Endpoint>,
        sequence: u32,
        now: Instant,
        max_non: usize,
        next_generation: &mut u64,
    ) -> PendingNotification<Endpoint> {
        let confirmable = relation.request.original.header.get_type() == MessageType::Confirmable
            || relation.non_notifications >= max_non;
        if confirmable {
            relation.non_notifications = 0;
        } else {
            relation.non_notifications += 1;
        }
        relation.last_sequence = sequence;
        relation.last_notify = Some(now);
        relation.generation = *next_generation;
        *next_generation += 1;
        PendingNotification {
            key: relation.key.clone(),
            request: relation.request.clone(),
            sequence,
            confirmable,
            replaces: if confirmable { relation.in_flight } else { None },
            generation: relation.generation,
            fallback: relation.conditions.fallback_interval(),
        }
    }

    /// Records the message id a notification went out with.
    pub fn record_sent(&mut self, key: &TokenKey<Endpoint>, message_id: MessageId, confirmable: bool) {
        if let Some(relation) = self.relations.get_mut(key) {
            relation.last_message_id = Some(message_id);
            if confirmable {
                relation.in_flight = Some(message_id);
            }
        }
    }

    /// A Confirmable notification finished (acknowledged or cancelled).
    pub fn complete(&mut self, key: &TokenKey<Endpoint>, message_id: MessageId) {
        if let Some(relation) = self.relations.get_mut(key) {
            if relation.in_flight == Some(message_id) {
                relation.in_flight = None;
            }
        }
    }

    /// A Confirmable notification failed (timeout or Reset): the observer is gone.  Only the
    /// relation that still owns `message_id` is removed.
    pub fn fail(&mut self, key: &TokenKey<Endpoint>, message_id: MessageId) -> bool {
        let owns = self
            .relations
            .get(key)
            .map_or(false, |r| r.in_flight == Some(message_id));
        if owns {
            self.relations.remove(key);
        }
        owns
    }
}
