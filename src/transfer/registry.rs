use super::info_hash::InfoHash;
use super::piece::Transfer;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-wide map from info hash to active transfer.
///
/// The accept path looks up every incoming handshake here; lookups
/// vastly outnumber registrations, hence the readers-writer lock.
pub struct TransferRegistry {
    transfers: RwLock<HashMap<InfoHash, Arc<Transfer>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self {
            transfers: RwLock::new(HashMap::new()),
        }
    }

    /// Makes a transfer visible to the accept path.
    pub fn register(&self, transfer: Arc<Transfer>) {
        self.transfers
            .write()
            .insert(transfer.info_hash(), transfer);
    }

    /// Removes and returns a transfer; inbound handshakes for it are
    /// rejected from then on.
    pub fn unregister(&self, info_hash: &InfoHash) -> Option<Arc<Transfer>> {
        self.transfers.write().remove(info_hash)
    }

    pub fn lookup(&self, info_hash: &InfoHash) -> Option<Arc<Transfer>> {
        self.transfers.read().get(info_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.transfers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.read().is_empty()
    }
}

impl Default for TransferRegistry {
    fn default() -> Self {
        Self::new()
    }
}
