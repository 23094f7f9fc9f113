//! Client core for exploring a dataset through a remote query service.
//!
//! A [`TableController`] owns filters, search, sort and pagination and publishes filter
//! changes on a [`SyncBus`]. A [`ChartController`] attached to the same bus keeps an aggregate
//! view scoped to those filters. Both apply only the response to their most recent request.

pub mod chart;
pub mod columns;
pub mod error;
pub mod filter_state;
pub mod http;
pub mod sequencer;
pub mod service;
pub mod sync_bus;
pub mod table;

pub use chart::{ChartConfig, ChartController, ChartEvent, ChartSnapshot};
pub use error::QueryError;
pub use filter_state::FilterState;
pub use http::{HttpQueryService, HttpServiceOptions};
pub use service::QueryService;
pub use sync_bus::{Subscription, SubscriptionId, SyncBus};
pub use table::{
    PageChange, PaginationState, SortState, TableController, TableEvent, TableSnapshot,
    DEFAULT_PAGE_SIZE,
};

/// What happened to the state a command was issued against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The response belonged to the latest request and is now visible.
    Applied,
    /// A newer request was issued before this response arrived; it was dropped.
    Stale,
    /// The command did not change the query, so nothing was issued.
    Unchanged,
    /// The chart has no x axis; no aggregate query is issued.
    Unconfigured,
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
