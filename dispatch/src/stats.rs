use crate::ChildId;

// Snapshot of the dispatch table, relayed outward once per second.
#[derive(Debug, Default, Clone)]
pub struct TableStats {

    pub live_requests: usize,

    pub child_stats: Vec<ChildStats>,

}

#[derive(Debug, Clone, Copy)]
pub struct ChildStats {

    pub child: ChildId,

    pub live_requests: usize,

    // Summed memory cost charged for the child's outstanding requests.
    pub memory_cost: usize,

}
