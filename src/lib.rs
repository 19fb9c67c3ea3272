//! Offline integrity and maintenance engine for persistent vector stores.
//!
//! A store root holds a relational catalog (`catalog.sqlite3`) and one
//! directory per vector segment. The [`admin`] operations inspect drift
//! between the two, compact segments, retune runtime parameters and trim
//! the write-ahead log. Every mutating operation runs under one exclusive
//! catalog transaction.

#![warn(missing_docs)]

pub mod admin;
pub mod catalog;
pub mod config;
pub mod error;
pub mod index;
pub mod logging;
pub mod sidecar;
pub mod store;
pub mod testkit;

pub use error::{MaintError, Result};
pub use store::Store;
