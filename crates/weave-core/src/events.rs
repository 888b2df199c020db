//! Event dispatch with pattern subscriptions
//!
//! Subscriptions pair a pattern (exact path, glob, or regex) with a
//! per-subscription unbounded channel; matching runs against the full
//! storage path, space tag included. Delivery is access-controlled:
//! user-space events reach only the owner's subscriptions, while `all`
//! and `frozen` events are delivered regardless of subscriber identity.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::codec::Value;
use crate::error::{WeaveError, WeaveResult};
use crate::identity::PublicKey;
use crate::space::{self, Space};

/// Subscription pattern over full storage paths.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    /// Matches one path exactly.
    Exact(String),
    /// `*` matches any run of characters; everything else is literal.
    Glob(String),
    /// A regular expression, matched unanchored like any regex.
    Regex(String),
}

impl Pattern {
    /// Compile to a reusable matcher.
    pub fn matcher(&self) -> WeaveResult<Matcher> {
        match self {
            Pattern::Exact(path) => Ok(Matcher::Exact(path.clone())),
            Pattern::Glob(glob) => {
                let mut expr = String::with_capacity(glob.len() + 8);
                expr.push('^');
                for ch in glob.chars() {
                    match ch {
                        '*' => expr.push_str(".*"),
                        ch => expr.push_str(&regex::escape(&ch.to_string())),
                    }
                }
                expr.push('$');
                let regex = Regex::new(&expr)
                    .map_err(|e| WeaveError::InvalidArgument(format!("Bad glob: {}", e)))?;
                Ok(Matcher::Regex(regex))
            }
            Pattern::Regex(expr) => {
                let regex = Regex::new(expr)
                    .map_err(|e| WeaveError::InvalidArgument(format!("Bad regex: {}", e)))?;
                Ok(Matcher::Regex(regex))
            }
        }
    }
}

/// A compiled subscription pattern.
pub enum Matcher {
    Exact(String),
    Regex(Regex),
}

impl Matcher {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Exact(exact) => exact == path,
            Matcher::Regex(regex) => regex.is_match(path),
        }
    }
}

/// A delivered event. `remote` is true iff the write arrived as an
/// admitted remote envelope.
#[derive(Debug, Clone)]
pub struct Event {
    pub path: String,
    pub space: Space,
    pub author: PublicKey,
    pub timestamp: u64,
    pub remote: bool,
    pub value: Option<Value>,
}

struct Subscription {
    compiled: Matcher,
    /// The subscriber's identity at subscribe time; gates user-space
    /// delivery.
    owner: Option<PublicKey>,
    tx: mpsc::UnboundedSender<Event>,
}

/// Registry of subscriptions; one channel per subscription.
#[derive(Default)]
pub struct EventDispatcher {
    subs: Mutex<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription. `owner` is the subscriber's public key,
    /// if a session is logged in; unauthenticated subscriptions receive
    /// only `all`/`frozen` events.
    pub fn subscribe(
        &self,
        pattern: Pattern,
        owner: Option<PublicKey>,
    ) -> WeaveResult<(u64, mpsc::UnboundedReceiver<Event>)> {
        let compiled = pattern.matcher()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subs.lock().insert(
            id,
            Subscription {
                compiled,
                owner,
                tx,
            },
        );
        Ok((id, rx))
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subs.lock().remove(&id).is_some()
    }

    /// Deliver an event to every matching, authorized subscription.
    /// Subscriptions whose receiver is gone are pruned. Returns the
    /// number of deliveries.
    pub fn emit(&self, event: &Event) -> usize {
        let mut subs = self.subs.lock();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, sub) in subs.iter() {
            if !sub.compiled.matches(&event.path) {
                continue;
            }
            if !authorized(sub.owner.as_ref(), event) {
                continue;
            }
            if sub.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            subs.remove(&id);
        }
        delivered
    }
}

/// User-space events are delivered only to the owner of the path.
fn authorized(owner: Option<&PublicKey>, event: &Event) -> bool {
    match event.space {
        Space::All | Space::Frozen => true,
        Space::User => match (owner, space::user_path_owner(&event.path)) {
            (Some(owner), Some(path_owner)) => owner.to_base64() == path_owner,
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn event(path: &str, space: Space, author: &PublicKey) -> Event {
        Event {
            path: path.to_string(),
            space,
            author: *author,
            timestamp: 1,
            remote: false,
            value: Some(Value::Int(1)),
        }
    }

    #[test]
    fn test_exact_pattern() {
        let dispatcher = EventDispatcher::new();
        let pk = Keypair::generate().public_key();
        let (_, mut rx) = dispatcher
            .subscribe(Pattern::Exact("all/k".to_string()), None)
            .unwrap();

        assert_eq!(dispatcher.emit(&event("all/k", Space::All, &pk)), 1);
        assert_eq!(dispatcher.emit(&event("all/k2", Space::All, &pk)), 0);
        assert_eq!(rx.try_recv().unwrap().path, "all/k");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_glob_pattern() {
        let dispatcher = EventDispatcher::new();
        let pk = Keypair::generate().public_key();
        let (_, mut rx) = dispatcher
            .subscribe(Pattern::Glob("all/chat/*".to_string()), None)
            .unwrap();

        assert_eq!(dispatcher.emit(&event("all/chat/room1", Space::All, &pk)), 1);
        assert_eq!(dispatcher.emit(&event("all/other", Space::All, &pk)), 0);
        // Glob must be anchored: a match in the middle is not enough.
        assert_eq!(dispatcher.emit(&event("x/all/chat/room", Space::All, &pk)), 0);
        assert_eq!(rx.try_recv().unwrap().path, "all/chat/room1");
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let dispatcher = EventDispatcher::new();
        let pk = Keypair::generate().public_key();
        let (_, mut rx) = dispatcher
            .subscribe(Pattern::Glob("all/a.b+c/*".to_string()), None)
            .unwrap();

        assert_eq!(dispatcher.emit(&event("all/a.b+c/x", Space::All, &pk)), 1);
        // '.' must not act as a wildcard.
        assert_eq!(dispatcher.emit(&event("all/aXb+c/x", Space::All, &pk)), 0);
        rx.try_recv().unwrap();
    }

    #[test]
    fn test_regex_pattern() {
        let dispatcher = EventDispatcher::new();
        let pk = Keypair::generate().public_key();
        let (_, mut rx) = dispatcher
            .subscribe(Pattern::Regex(r"^all/room-\d+$".to_string()), None)
            .unwrap();

        assert_eq!(dispatcher.emit(&event("all/room-42", Space::All, &pk)), 1);
        assert_eq!(dispatcher.emit(&event("all/room-x", Space::All, &pk)), 0);
        rx.try_recv().unwrap();
    }

    #[test]
    fn test_bad_regex_rejected() {
        let dispatcher = EventDispatcher::new();
        assert!(dispatcher
            .subscribe(Pattern::Regex("(unclosed".to_string()), None)
            .is_err());
    }

    #[test]
    fn test_user_space_gated_to_owner() {
        let dispatcher = EventDispatcher::new();
        let alice = Keypair::generate().public_key();
        let bob = Keypair::generate().public_key();
        let path = format!("user/{}/diary", alice.to_base64());

        let (_, mut alice_rx) = dispatcher
            .subscribe(Pattern::Glob(format!("user/{}/*", alice.to_base64())), Some(alice))
            .unwrap();
        let (_, mut bob_rx) = dispatcher
            .subscribe(Pattern::Glob(format!("user/{}/*", alice.to_base64())), Some(bob))
            .unwrap();
        let (_, mut anon_rx) = dispatcher
            .subscribe(Pattern::Glob("user/*".to_string()), None)
            .unwrap();

        assert_eq!(dispatcher.emit(&event(&path, Space::User, &alice)), 1);
        assert_eq!(alice_rx.try_recv().unwrap().path, path);
        assert!(bob_rx.try_recv().is_err());
        assert!(anon_rx.try_recv().is_err());
    }

    #[test]
    fn test_public_spaces_delivered_to_everyone() {
        let dispatcher = EventDispatcher::new();
        let alice = Keypair::generate().public_key();
        let bob = Keypair::generate().public_key();

        let (_, mut bob_rx) = dispatcher
            .subscribe(Pattern::Glob("*".to_string()), Some(bob))
            .unwrap();
        let (_, mut anon_rx) = dispatcher
            .subscribe(Pattern::Glob("*".to_string()), None)
            .unwrap();

        dispatcher.emit(&event("all/k", Space::All, &alice));
        dispatcher.emit(&event("frozen/k", Space::Frozen, &alice));

        assert_eq!(bob_rx.try_recv().unwrap().space, Space::All);
        assert_eq!(bob_rx.try_recv().unwrap().space, Space::Frozen);
        assert_eq!(anon_rx.try_recv().unwrap().space, Space::All);
        assert_eq!(anon_rx.try_recv().unwrap().space, Space::Frozen);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let pk = Keypair::generate().public_key();
        let (id, mut rx) = dispatcher
            .subscribe(Pattern::Glob("*".to_string()), None)
            .unwrap();

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.emit(&event("all/k", Space::All, &pk)), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_pruned() {
        let dispatcher = EventDispatcher::new();
        let pk = Keypair::generate().public_key();
        let (_, rx) = dispatcher
            .subscribe(Pattern::Glob("*".to_string()), None)
            .unwrap();
        drop(rx);

        assert_eq!(dispatcher.emit(&event("all/k", Space::All, &pk)), 0);
        assert!(dispatcher.subs.lock().is_empty());
    }

    #[test]
    fn test_ordered_delivery_per_path() {
        let dispatcher = EventDispatcher::new();
        let pk = Keypair::generate().public_key();
        let (_, mut rx) = dispatcher
            .subscribe(Pattern::Exact("all/k".to_string()), None)
            .unwrap();

        for ts in 1..=3 {
            let mut e = event("all/k", Space::All, &pk);
            e.timestamp = ts;
            dispatcher.emit(&e);
        }
        assert_eq!(rx.try_recv().unwrap().timestamp, 1);
        assert_eq!(rx.try_recv().unwrap().timestamp, 2);
        assert_eq!(rx.try_recv().unwrap().timestamp, 3);
    }
}
