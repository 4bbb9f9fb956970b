//! Metrics for the key-value client.

use iroh_metrics::{
    core::{Counter, Metric},
    struct_iterable::Iterable,
};

/// Enum of metrics for the module
#[allow(missing_docs)]
#[derive(Debug, Clone, Iterable)]
pub struct Metrics {
    pub publications_processed: Counter,
    pub keys_advertised: Counter,
    pub ttl_refreshes_sent: Counter,
    pub reassertions: Counter,
    pub keys_restored: Counter,
    pub store_write_errors: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            publications_processed: Counter::new("Number of publications received from the store"),
            keys_advertised: Counter::new("Number of key-vals pushed to the store"),
            ttl_refreshes_sent: Counter::new("Number of value-less ttl refreshes sent"),
            reassertions: Counter::new("Number of times ownership of a key was reasserted"),
            keys_restored: Counter::new("Number of persisted keys re-advertised by the sweeper"),
            store_write_errors: Counter::new("Number of failed set-key-vals calls"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "floodkv_client"
    }
}
