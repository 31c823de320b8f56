//! Integration tests for the routing core
//!
//! This test suite validates multi-node behavior that no single crate can
//! test on its own:
//! - Route convergence across several nodes on an in-memory link bus
//! - Flood loop suppression and duplicate handling under relay
//! - Neighbor loss and the resulting map teardown
//! - Cross-group discovery and border bookkeeping

pub mod test_utils;

#[cfg(test)]
mod convergence_tests;

#[cfg(test)]
mod hierarchy_tests;
