use crate::connection::PeerConnection;
use crate::{Endpoint, Error, Result};
use std::collections::{hash_map::Entry, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};

/// What the registry needs from a connection.
pub trait Link: Clone + Send + Sync + 'static {
    /// unique per registry, see [`Registry::next_id`]
    fn id(&self) -> u64;
    fn is_connected(&self) -> bool;
    /// closed or failed, waiting for its read loop to evict it
    fn is_closed(&self) -> bool;
    fn send(&self, payload: &[u8]) -> Result<()>;
    fn close(&self);
    fn join(&self) {}
}

/// Outcome of [`Registry::broadcast`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sent: Vec<Endpoint>,
    /// send failed, the connection was evicted and closed
    pub failed: Vec<Endpoint>,
    /// still handshaking
    pub skipped: Vec<Endpoint>,
}

struct Shared<L> {
    peers: Mutex<HashMap<Endpoint, L>>,
    count: AtomicU64,
}

/// Live connections keyed by peer endpoint.
///
/// The map lock is never held while sending or closing.
pub struct Registry<L = PeerConnection> {
    shared: Arc<Shared<L>>,
}

impl<L> Clone for Registry<L> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<L> Default for Registry<L> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared {
                peers: Default::default(),
                count: AtomicU64::new(0),
            }),
        }
    }
}

impl<L: Link> Registry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.shared.count.fetch_add(1, Relaxed) + 1
    }

    /// insert or replace, returning the replaced connection
    pub fn add(&self, endpoint: Endpoint, link: L) -> Option<L> {
        let old = self.shared.peers.lock().unwrap().insert(endpoint, link);
        if old.is_some() {
            log::debug!("replacing connection to {}", endpoint);
        }
        old
    }

    /// Insert unless a live connection to `endpoint` is registered.
    ///
    /// A closed leftover is replaced and returned in `Ok`, a live entry is
    /// kept and returned in `Err`.
    pub fn add_if_absent(
        &self,
        endpoint: Endpoint,
        link: L,
    ) -> std::result::Result<Option<L>, L> {
        match self.shared.peers.lock().unwrap().entry(endpoint) {
            Entry::Occupied(e) if !e.get().is_closed() => Err(e.get().clone()),
            Entry::Occupied(mut e) => Ok(Some(e.insert(link))),
            Entry::Vacant(e) => {
                e.insert(link);
                Ok(None)
            }
        }
    }

    pub fn remove(&self, endpoint: &Endpoint) -> Option<L> {
        self.shared.peers.lock().unwrap().remove(endpoint)
    }

    /// remove only if the entry is still the connection `id`, not a replacement
    pub fn remove_if(&self, endpoint: &Endpoint, id: u64) -> Option<L> {
        let mut peers = self.shared.peers.lock().unwrap();
        match peers.get(endpoint) {
            Some(l) if l.id() == id => peers.remove(endpoint),
            _ => None,
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<L> {
        self.shared.peers.lock().unwrap().get(endpoint).cloned()
    }

    pub fn list(&self) -> BTreeSet<Endpoint> {
        self.shared.peers.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `payload` to `target`, or to every connected peer.
    ///
    /// A failed send evicts and closes that connection, the rest still get
    /// the payload. An unknown or still handshaking target is `NotConnected`.
    pub fn broadcast(&self, payload: &[u8], target: Option<Endpoint>) -> Result<Delivery> {
        let links: Vec<(Endpoint, L)> = match target {
            Some(ep) => {
                let link = self.get(&ep).ok_or(Error::NotConnected(ep))?;
                if !link.is_connected() {
                    return Err(Error::NotConnected(ep));
                }
                vec![(ep, link)]
            }
            None => self
                .shared
                .peers
                .lock()
                .unwrap()
                .iter()
                .map(|(ep, l)| (*ep, l.clone()))
                .collect(),
        };

        let mut delivery = Delivery::default();
        for (ep, link) in links {
            if !link.is_connected() {
                delivery.skipped.push(ep);
                continue;
            }

            match link.send(payload) {
                Ok(()) => delivery.sent.push(ep),
                Err(Error::NotConnected(_)) => delivery.skipped.push(ep),
                Err(e) => {
                    log::warn!("send to {} failed: {}", ep, e);
                    self.remove_if(&ep, link.id());
                    link.close();
                    delivery.failed.push(ep);
                }
            }
        }

        Ok(delivery)
    }

    /// close every connection and wait for their threads
    pub fn shutdown(&self) {
        let links: Vec<L> = self
            .shared
            .peers
            .lock()
            .unwrap()
            .drain()
            .map(|(_, l)| l)
            .collect();

        for l in &links {
            l.close();
        }
        for l in &links {
            l.join();
        }
    }
}
