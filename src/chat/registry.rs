/// Per-instance registries: who is connected, and what they call themselves.
///
/// Both are keyed by connection identity (the peer address). They live
/// together in [`ServerState`](super::server::ServerState) behind one lock.
use std::collections::HashMap;

use tokio::sync::mpsc;

use super::command::is_valid_nick;

/// Handle to send lines to a connected client's session task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub tx: mpsc::UnboundedSender<String>,
}

impl ClientHandle {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

/// identity → nickname.
#[derive(Debug, Default)]
pub struct NickRegistry {
    nicks: HashMap<String, String>,
}

impl NickRegistry {
    pub fn get(&self, identity: &str) -> Option<&str> {
        self.nicks.get(identity).map(String::as_str)
    }

    /// Store `nick` for `identity`. Refuses names that fail validation.
    pub fn set(&mut self, identity: &str, nick: &str) -> bool {
        if !is_valid_nick(nick) {
            return false;
        }
        self.nicks.insert(identity.to_owned(), nick.to_owned());
        true
    }

    pub fn remove(&mut self, identity: &str) -> Option<String> {
        self.nicks.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.nicks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nicks.is_empty()
    }
}

/// identity → session handle. Only the bus subscriber delivers through it.
#[derive(Debug, Default)]
pub struct BroadcastRegistry {
    clients: HashMap<String, ClientHandle>,
}

impl BroadcastRegistry {
    /// Add a session. Returns `false` (and changes nothing) if the identity
    /// is already live.
    pub fn register(&mut self, identity: &str, handle: ClientHandle) -> bool {
        if self.clients.contains_key(identity) {
            return false;
        }
        self.clients.insert(identity.to_owned(), handle);
        true
    }

    pub fn unregister(&mut self, identity: &str) -> bool {
        self.clients.remove(identity).is_some()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.clients.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send `text` to every registered session.
    pub fn deliver_to_all(&self, text: &str) {
        self.deliver_except(text, None);
    }

    /// Send `text` to every registered session but `skip`.
    ///
    /// A closed handle is ignored; it doesn't stop delivery to the rest.
    pub fn deliver_except(&self, text: &str, skip: Option<&str>) {
        for (identity, handle) in &self.clients {
            if Some(identity.as_str()) == skip {
                continue;
            }
            let _ = handle.tx.send(text.to_owned());
        }
    }
}
