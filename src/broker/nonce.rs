/// Local view of the next transaction sequence number for one account.
///
/// The ledger's pending count lags behind when transactions were sent but not
/// yet seen by the node, so the tracker never hands out anything below what it
/// has already used.
#[derive(Debug, Default, Clone)]
pub struct NonceTracker {
    next: Option<u64>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nonce for a fresh transaction given the ledger's pending count.
    pub fn assign(&self, pending: u64) -> u64 {
        self.next.map_or(pending, |next| next.max(pending))
    }

    /// `nonce` was consumed on the ledger (or is in the pool for good).
    pub fn commit(&mut self, nonce: u64) {
        let after = nonce.saturating_add(1);
        self.next = Some(self.next.map_or(after, |next| next.max(after)));
    }

    /// Trust the ledger again, e.g. after the pool evicted our transactions.
    pub fn reset(&mut self, pending: u64) {
        self.next = Some(pending);
    }
}
