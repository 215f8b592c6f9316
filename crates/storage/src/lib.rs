//! Document storage for Factory.
//!
//! This crate provides a trait-based document store interface with a JSON
//! reference implementation and live change subscriptions.

#![warn(missing_docs)]

pub mod filter;
pub mod json_storage;
pub mod trait_;

pub use filter::Filter;
pub use json_storage::JsonStore;
pub use trait_::{Change, ChangeStream, Document, DocumentStore, Result, StoreError};
