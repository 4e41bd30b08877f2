//! Domain layer: value objects, the order state machine, and the ports the
//! application layer talks through.

pub mod accrual;
pub mod luhn;
pub mod money;
pub mod order;
pub mod ports;
pub mod task;
pub mod user;
pub mod withdrawal;
