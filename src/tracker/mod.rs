pub mod client_tracker;
pub mod single_flight;
pub mod usage_tracker;

pub use client_tracker::ClientUsageTracker;
pub use single_flight::SingleFlight;
pub use usage_tracker::UsageTracker;
