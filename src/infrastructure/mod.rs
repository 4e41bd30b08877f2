//! Adapters behind the domain ports.

pub mod accrual_client;
#[cfg(feature = "queue-amqp")]
pub mod amqp;
pub mod in_memory;
pub mod memory_queue;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
