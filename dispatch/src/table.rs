use std::collections::HashMap;
use crate::{
    request::{DescriptorParams, RequestDescriptor},
    stats::{ChildStats, TableStats},
    wire::RequestHead,
    ChildId, RequestId, RequestKey,
};

// Fixed overhead charged per outstanding request before counting the strings
// carried for its lifetime.
const BASE_REQUEST_COST: usize = 4096;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TableError {

    // A live descriptor already uses this id. Refused and surfaced to the
    // child as a request failure.
    #[error("child {child} reused live request id {request}")]
    InvalidRequest { child: ChildId, request: RequestId },

    #[error("child {child} over memory budget: {charged} + {cost} > {ceiling}")]
    QuotaExceeded {
        child: ChildId,
        charged: usize,
        cost: usize,
        ceiling: usize,
    },

    // Expected under races with teardown, callers log at low severity.
    #[error("no live request {request} for child {child}")]
    NotFound { child: ChildId, request: RequestId },

}

// Owns every live RequestDescriptor, keyed by (child, request), plus the
// per-child memory ledger used for admission control.
#[derive(Debug)]
pub struct RequestDispatchTable {

    requests: HashMap<RequestKey, RequestDescriptor>,

    // Summed memory cost of each child's outstanding requests.
    ledger: HashMap<ChildId, usize>,

    max_cost_per_child: usize,

}

fn request_cost(params: &DescriptorParams, head: &RequestHead) -> usize {
    BASE_REQUEST_COST
        + head.url.as_str().len()
        + head.referrer.len()
        + head.extra_headers.len()
        + params.frame_origin.len()
        + params.main_frame_origin.len()
}

impl RequestDispatchTable {

    pub fn new(max_cost_per_child: usize) -> RequestDispatchTable {
        RequestDispatchTable {
            requests: HashMap::new(),
            ledger: HashMap::new(),
            max_cost_per_child,
        }
    }

    // Creates and charges a descriptor for the request, refusing duplicates
    // and children over budget. Neither failure leaves a charge behind.
    pub fn admit(
        &mut self,
        params: DescriptorParams,
        head: &RequestHead,
    ) -> Result<&mut RequestDescriptor, TableError> {

        let key = RequestKey {
            child: params.child_id,
            request: params.request_id,
        };
        if self.requests.contains_key(&key) {
            return Err(TableError::InvalidRequest {
                child: key.child,
                request: key.request,
            });
        }

        let cost = request_cost(&params, head);
        let charged = self.ledger.get(&key.child).copied().unwrap_or(0);
        if charged + cost > self.max_cost_per_child {
            return Err(TableError::QuotaExceeded {
                child: key.child,
                charged,
                cost,
                ceiling: self.max_cost_per_child,
            });
        }

        let mut descriptor = RequestDescriptor::new(params);
        descriptor.charge_memory_cost(cost);
        *self.ledger.entry(key.child).or_default() += cost;
        tracing::trace!("admitted {:?} at cost {}", key, cost);

        Ok(self.requests.entry(key).or_insert(descriptor))
    }

    pub fn get(&self, key: RequestKey) -> Option<&RequestDescriptor> {
        self.requests.get(&key)
    }

    pub fn get_mut(&mut self, key: RequestKey) -> Option<&mut RequestDescriptor> {
        self.requests.get_mut(&key)
    }

    // Releases the descriptor's charge and removes it. A second removal is
    // NotFound, the peer may have retried a teardown message.
    pub fn remove(&mut self, key: RequestKey) -> Result<RequestDescriptor, TableError> {
        let mut descriptor = self.requests.remove(&key).ok_or(TableError::NotFound {
            child: key.child,
            request: key.request,
        })?;
        self.release(key.child, descriptor.release_memory_cost());
        Ok(descriptor)
    }

    // Removes every descriptor for the child, used when it disconnects.
    // Returns the number removed.
    pub fn cancel_all(&mut self, child: ChildId) -> usize {
        let before = self.requests.len();
        self.requests.retain(|key, _| key.child != child);
        self.ledger.remove(&child);
        before - self.requests.len()
    }

    pub fn child_cost(&self, child: ChildId) -> usize {
        self.ledger.get(&child).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn stats(&self) -> TableStats {
        let mut per_child: HashMap<ChildId, ChildStats> = HashMap::new();
        for key in self.requests.keys() {
            per_child
                .entry(key.child)
                .or_insert(ChildStats {
                    child: key.child,
                    live_requests: 0,
                    memory_cost: self.child_cost(key.child),
                })
                .live_requests += 1;
        }
        let mut child_stats: Vec<ChildStats> = per_child.into_values().collect();
        child_stats.sort_by_key(|stats| stats.child);
        TableStats {
            live_requests: self.requests.len(),
            child_stats,
        }
    }

    fn release(&mut self, child: ChildId, cost: usize) {
        if let Some(charged) = self.ledger.get_mut(&child) {
            *charged = charged.saturating_sub(cost);
            if *charged == 0 {
                self.ledger.remove(&child);
            }
        }
    }
}
