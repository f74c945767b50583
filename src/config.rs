//! Configuration for the queue bridge

/// Configuration for bridging a pipeline into a pull-based cursor.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Capacity of the bridge queue — the backpressure bound between the
    /// feeder and the consumer.
    pub capacity: usize,
    /// How many elements the feeder resolves concurrently while preserving
    /// index order. `None` uses the bound pool's width.
    pub in_flight: Option<usize>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            in_flight: None,
        }
    }
}
