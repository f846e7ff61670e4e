/// Relay measurement ingestion and pairwise stats
pub mod aggregator;
pub mod relay;

pub use aggregator::{Aggregator, INVALID_ROUTE_VALUE};
pub use relay::{
    relay_id, relays_csv, RelayInfo, RelayReport, RelaySample, RelayStatus, RelayUpdate,
    RELAYS_CSV_HEADER,
};
