//! Log collection pipelines.
//!
//! This crate receives log events from the outside world and delivers them, in batches,
//! to a consumer provided by the host application.
//!
//! ```text
//! input -> intermediate operators -> (output) -> converter -> consumer
//! ```
//!
//! # Operators and pipelines
//! A pipeline is an ordered chain of [operators](operator::Operator), described in the
//! configuration by a list of tables with a `type`. The type is looked up in an
//! [`OperatorRegistry`](operator::registry::OperatorRegistry), which contains the built-in
//! operators (see [`operators`]) and the operators registered by the application, such as
//! the HTTP input. If the type is not registered, it is looked up in the
//! [plugin templates](plugin), which are small parameterized pipelines loaded from a
//! directory.
//!
//! # Batching
//! The entries that leave the pipeline are grouped into batches by the
//! [`Converter`](converter::Converter), by count or by time, then converted to
//! [`Logs`](logs::Logs) and given to the [`LogsConsumer`](receiver::LogsConsumer).
//!
//! # Running
//! The [`Receiver`](receiver::Receiver) builds everything from a
//! [`ReceiverConfig`](config::ReceiverConfig) and manages the lifecycle.

pub mod config;
pub mod converter;
pub mod entry;
pub mod logs;
pub mod operator;
pub mod operators;
pub mod pipeline;
pub mod plugin;
pub mod receiver;
