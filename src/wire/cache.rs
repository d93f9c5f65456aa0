//! Buffer for envelopes that arrive before anyone is ready to handle them.
//!
//! An envelope is only retained if at least one registered predicate wants
//! it. It stays in the cache until it is drained by [Cache::messages] or the
//! cache is flushed.

use crate::messages::Envelope;
use std::{collections::HashMap, fmt, sync::Arc};

pub type Predicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Handle of a registered predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PredicateId(u64);

#[derive(Default)]
pub struct Cache {
    msgs: Vec<Envelope>,
    preds: HashMap<PredicateId, Predicate>,
    next_id: u64,
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("size", &self.msgs.len())
            .field("predicates", &self.preds.len())
            .finish()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start retaining envelopes matching `pred`.
    pub fn cache(&mut self, pred: Predicate) -> PredicateId {
        let id = PredicateId(self.next_id);
        self.next_id += 1;
        self.preds.insert(id, pred);
        id
    }

    /// Stop retaining envelopes for `id`. Already cached envelopes stay.
    pub fn release(&mut self, id: PredicateId) {
        self.preds.remove(&id);
    }

    /// Retain `env` if any registered predicate matches it.
    pub fn put(&mut self, env: Envelope) -> bool {
        if !self.preds.values().any(|p| p(&env)) {
            return false;
        }
        self.msgs.push(env);
        true
    }

    /// Remove and return all cached envelopes matching `filter`, in arrival
    /// order.
    pub fn messages(&mut self, filter: impl Fn(&Envelope) -> bool) -> Vec<Envelope> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.msgs)
            .into_iter()
            .partition(|e| filter(e));
        self.msgs = rest;
        matching
    }

    pub fn count(&self, filter: impl Fn(&Envelope) -> bool) -> usize {
        self.msgs.iter().filter(|e| filter(e)).count()
    }

    /// Drop all envelopes and predicates.
    pub fn flush(&mut self) {
        self.msgs.clear();
        self.preds.clear();
    }

    pub fn size(&self) -> usize {
        self.msgs.len()
    }
}
