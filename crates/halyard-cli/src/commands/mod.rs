//! CLI command implementations.

pub mod ledger;
pub mod migrate;
pub mod pipeline;
pub mod session;
pub mod token;
