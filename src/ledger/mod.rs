//! Credit metering for admitted requests.

mod context;
mod cost;
mod credit;

pub use context::RequestContext;
pub use cost::RouteCostTable;
pub use credit::{CreditLedger, Settlement};
