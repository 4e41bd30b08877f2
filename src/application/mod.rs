//! Application layer orchestrating the reconciliation pipeline.
//!
//! Intake records orders and queues them, the dispatcher runs a fixed pool of
//! observers over the queue, and the relay republishes anything intake could
//! not hand over. `LoyaltyService` is the facade inbound adapters call.

pub mod dispatcher;
pub mod intake;
pub mod observer;
pub mod relay;
pub mod service;
