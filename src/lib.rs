// ABOUTME: Library root for binlog-relay
// ABOUTME: MySQL binlog change events relayed to Kafka topics named after their table

pub mod broker;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod normalize;
pub mod relay;
pub mod shutdown;
pub mod source;

pub use error::RelayError;
