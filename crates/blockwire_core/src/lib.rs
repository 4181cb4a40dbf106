//! # blockwire core
//!
//! The append-only transaction log ("block chain") that serves as the
//! durable content store.
//!
//! This crate provides:
//! - [`Transaction`] framing with equal leading and trailing sentinels
//! - [`Definition`]s and the forward-only [`Schema`] parser
//! - [`TableMeta`], the mapping between a Rust record type and its entity type
//! - [`BlockChain`], which replays a log into typed [`Table`]s on open and
//!   appends new records through the same path
//! - [`ForwardReader`] and [`BackwardReader`] for streaming scans
//!
//! The log holds nothing but transactions. Schema records declare fields
//! and entity types; instance records create, update and archive entities.
//! Replaying the log from the start always rebuilds the same state.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod definition;
mod error;
mod log;
mod meta;
mod schema;
mod table;
mod transaction;
mod types;

pub use config::{ChainConfig, FORMAT_VERSION};
pub use definition::{Definition, DefinitionKind};
pub use error::{CoreError, CoreResult};
pub use log::{
    inspect, verify_log, BackwardReader, BlockChain, BlockChainBuilder, ForwardReader,
    LoggedRecord, Rejection, ReplayReport, VerifyReport,
};
pub use meta::{FieldAccessor, ReadFn, TableMeta, WriteFn};
pub use schema::{Schema, SchemaChange};
pub use table::{Entry, Record, Table};
pub use transaction::Transaction;
pub use types::{reserved, system_clock, Clock, DefinitionId, EntityId, Timestamp};
