//! FIFO queue of considerations waiting to be confirmed, with admission
//! control: a consideration is only admitted if the sender's imbalance
//! (through the pending overlay) stays non-negative and the transfer would
//! not close a cycle in the consideration graph.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::consideration::{
    check_consideration_series, Consideration, ConsiderationID, Signature,
};
use crate::error::{ProcessError, ValidationError};
use crate::graph::{graph_key, Graph};
use crate::imbalance_cache::ImbalanceCache;
use crate::ledger::Ledger;

/// Interface to a queue of considerations to be confirmed.
pub trait ConsiderationQueue: Send + Sync {
    /// Adds the consideration to the queue. Returns true if the
    /// consideration was added to the queue on this call.
    fn add(&self, id: &ConsiderationID, cn: &Consideration) -> Result<bool, ProcessError>;

    /// Adds a batch of considerations to the queue (a view has been
    /// disconnected). `height` is the focal point height after this
    /// disconnection.
    fn add_batch(&self, ids: &[ConsiderationID], cns: &[Consideration], height: i64);

    /// Removes a batch of considerations from the queue (a view has been
    /// connected). `height` is the focal point height after this connection.
    /// `more` indicates if more connections are coming.
    fn remove_batch(
        &self,
        ids: &[ConsiderationID],
        height: i64,
        more: bool,
    ) -> Result<(), ProcessError>;

    /// Returns considerations in the queue for the renderer. A `limit` of
    /// zero means no limit.
    fn get(&self, limit: usize) -> Vec<Consideration>;

    /// Returns true if the given consideration is in the queue.
    fn exists(&self, id: &ConsiderationID) -> bool;

    /// Returns true if the given consideration is in the queue and contains
    /// the given signature.
    fn exists_signed(&self, id: &ConsiderationID, signature: &Signature) -> bool;

    /// Returns the queue length.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct QueueInner {
    /// Admission order. May contain stale IDs whose entries have been
    /// removed from `cn_map`; they're skipped on read and dropped on
    /// reprocessing.
    order: VecDeque<ConsiderationID>,
    cn_map: HashMap<ConsiderationID, Consideration>,
    imbalance_cache: ImbalanceCache,
}

/// An in-memory FIFO implementation of the [`ConsiderationQueue`] interface.
pub struct ConsiderationQueueMemory {
    ledger: Arc<dyn Ledger>,
    con_graph: Arc<RwLock<Graph>>,
    inner: Mutex<QueueInner>,
}

impl ConsiderationQueueMemory {
    pub fn new(ledger: Arc<dyn Ledger>, con_graph: Arc<RwLock<Graph>>) -> Self {
        ConsiderationQueueMemory {
            ledger,
            con_graph,
            inner: Mutex::new(QueueInner {
                order: VecDeque::new(),
                cn_map: HashMap::new(),
                imbalance_cache: ImbalanceCache::new(),
            }),
        }
    }

    /// Rebuild the imbalance cache and remove considerations now in violation.
    fn reprocess_queue(&self, inner: &mut QueueInner, height: i64) -> Result<(), ProcessError> {
        // invalidate the cache
        inner.imbalance_cache.reset();

        let order: Vec<ConsiderationID> = inner.order.drain(..).collect();
        for id in order {
            let cn = match inner.cn_map.get(&id) {
                Some(cn) => cn,
                // stale entry, drop it
                None => continue,
            };

            // check that the series would still be valid, and maturity and
            // expiration if included in the next view
            if !check_consideration_series(cn, height + 1)
                || !cn.is_mature(height + 1)
                || cn.is_expired(height + 1)
            {
                inner.cn_map.remove(&id);
                continue;
            }

            // check imbalance and graph ancestry
            let ok = inner.imbalance_cache.apply(self.ledger.as_ref(), cn)?;
            let cyclic = self
                .con_graph
                .read()
                .is_parent_descendant(&graph_key(Some(&cn.for_)), &graph_key(cn.by.as_ref()));
            if !ok || cyclic {
                inner.cn_map.remove(&id);
                continue;
            }

            inner.order.push_back(id);
        }
        Ok(())
    }
}

impl ConsiderationQueue for ConsiderationQueueMemory {
    fn add(&self, id: &ConsiderationID, cn: &Consideration) -> Result<bool, ProcessError> {
        let mut inner = self.inner.lock();
        if inner.cn_map.contains_key(id) {
            // already exists
            return Ok(false);
        }

        // check sender imbalance and update sender and recipient imbalances
        if !inner.imbalance_cache.apply(self.ledger.as_ref(), cn)? {
            // insufficient sender imbalance
            return Err(ValidationError::InsufficientImbalance(*id).into());
        }

        if self
            .con_graph
            .read()
            .is_parent_descendant(&graph_key(Some(&cn.for_)), &graph_key(cn.by.as_ref()))
        {
            return Err(ValidationError::AncestorCycle(*id).into());
        }

        // add to the back of the queue
        inner.order.push_back(*id);
        inner.cn_map.insert(*id, cn.clone());
        Ok(true)
    }

    fn add_batch(&self, ids: &[ConsiderationID], cns: &[Consideration], _height: i64) {
        let mut inner = self.inner.lock();

        // add to the front in reverse order: formerly confirmed
        // considerations get the highest priority for the next view
        for (id, cn) in ids.iter().zip(cns.iter()).rev() {
            // an existing entry is superseded; its old position goes stale
            inner.order.push_front(*id);
            inner.cn_map.insert(*id, cn.clone());
        }

        // nothing is invalidated on maturity/expiration/imbalance yet:
        // if we're disconnecting a view we'll be connecting some shortly
    }

    fn remove_batch(
        &self,
        ids: &[ConsiderationID],
        height: i64,
        more: bool,
    ) -> Result<(), ProcessError> {
        let mut inner = self.inner.lock();
        for id in ids {
            // positions in `order` go stale and are skipped on read
            inner.cn_map.remove(id);
        }

        if more {
            // don't invalidate anything on series/maturity/expiration/imbalance
            // until we're done connecting all of the views we intend to
            return Ok(());
        }

        self.reprocess_queue(&mut inner, height)
    }

    fn get(&self, limit: usize) -> Vec<Consideration> {
        let inner = self.inner.lock();
        let cap = if limit == 0 || inner.cn_map.len() < limit {
            inner.cn_map.len()
        } else {
            limit
        };
        let mut cns = Vec::with_capacity(cap);
        let mut seen = std::collections::HashSet::new();
        for id in &inner.order {
            if cns.len() == cap {
                break;
            }
            if !seen.insert(*id) {
                continue;
            }
            if let Some(cn) = inner.cn_map.get(id) {
                cns.push(cn.clone());
            }
        }
        cns
    }

    fn exists(&self, id: &ConsiderationID) -> bool {
        self.inner.lock().cn_map.contains_key(id)
    }

    fn exists_signed(&self, id: &ConsiderationID, signature: &Signature) -> bool {
        match self.inner.lock().cn_map.get(id) {
            Some(cn) => cn.signature.as_ref() == Some(signature),
            None => false,
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().cn_map.len()
    }
}
