pub mod amqp;
pub mod publisher;

pub use amqp::{listen_manual_overrides, AmqpPublisher};
pub use publisher::{CsvPublisher, SnapshotPublisher, SnapshotRow};
