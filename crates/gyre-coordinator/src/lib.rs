//! Gyre Coordinator
//!
//! The round coordinator: persistence, the phase state machine, unsigned
//! transaction assembly, signature aggregation and the TCP connection
//! manager. The [`coordinator::Coordinator`] task is the single writer
//! for all round state; everything else feeds its event queue.

pub mod aggregator;
pub mod builder;
pub mod connection;
pub mod coordinator;
pub mod store;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, Event};
pub use store::{Store, StoreError};
