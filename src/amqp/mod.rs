//! Publish-only AMQP 0-9-1 transport.

pub mod codec;
pub mod connection;
pub mod frame;

pub use codec::{AmqpCodec, MAX_FRAME_SIZE};
pub use connection::{AmqpChannel, AmqpConnection, AmqpDialer, Publish, Tuning, negotiate_tuning};
pub use frame::{AmqpFrame, BasicProperties, ContentHeader, FieldTable, FieldValue, Method};
