use std::collections::{HashMap, HashSet};
use std::fmt;
use std::os::unix::net::UnixStream;

use crate::wire::Decoder;

/// Broker-assigned handle for one connected client. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Everything the broker tracks for one connection.
pub struct ClientEntry {
    pub stream: UnixStream,
    /// Blocks sent to this client and not yet acknowledged. The broker holds
    /// one arena reference per entry on the client's behalf.
    pub pending: HashSet<u32>,
    pub decoder: Decoder,
}

/// Connected clients of one broker.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, ClientEntry>,
    next_id: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stream: UnixStream) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.clients.insert(
            id,
            ClientEntry {
                stream,
                pending: HashSet::new(),
                decoder: Decoder::new(),
            },
        );
        id
    }

    pub fn remove(&mut self, id: ClientId) -> Option<ClientEntry> {
        self.clients.remove(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut ClientEntry> {
        self.clients.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientId, &ClientEntry)> {
        self.clients.iter().map(|(id, e)| (*id, e))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClientId, &mut ClientEntry)> {
        self.clients.iter_mut().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_not_reused_after_removal() {
        let mut reg = ClientRegistry::new();
        let (a, _a_peer) = UnixStream::pair().unwrap();
        let (b, _b_peer) = UnixStream::pair().unwrap();

        let first = reg.insert(a);
        assert!(reg.remove(first).is_some());
        let second = reg.insert(b);
        assert_ne!(first, second);
        assert_eq!(reg.len(), 1);
        assert!(reg.get_mut(first).is_none());
    }
}
