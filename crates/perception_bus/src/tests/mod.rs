//! Scenario tests for the perception bus
//!
//! - Perception scenarios: subject tracking driven by gain/lose traffic
//! - Replication scenarios: two agents keeping copies of one filter in sync
//! - Namespace routing through sub-object filters


#[cfg(test)]
pub mod replication_test;
