// Ceiling on the summed memory cost of one child's outstanding requests.
const MAX_COST_PER_CHILD: usize = 25 * 1024 * 1024;

// Unacked data messages toward a child before its request is paused.
const MAX_PENDING_DATA: u32 = 20;

#[derive(Debug, Clone)]
pub struct Config {

    pub max_cost_per_child: usize,

    pub max_pending_data: u32,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_cost_per_child: MAX_COST_PER_CHILD,
            max_pending_data: MAX_PENDING_DATA,
        }
    }
}
