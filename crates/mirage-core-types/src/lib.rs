//! Core types shared across Mirage facilities
//!
//! This crate provides the foundational leaf types used by the engine,
//! its error handling and its logging facilities:
//!
//! - **Scalar values**: the `Value` enum and `FieldMap` rows
//! - **Change records**: the insert/update/delete/command wire shapes
//! - **Correlation types**: RequestId, TraceId
//! - **Schema constants**: canonical field keys and event names

pub mod change;
pub mod correlation;
pub mod schema;
pub mod value;

pub use change::{ChangeKind, ChangeRecord};
pub use correlation::{RequestId, TraceId};
pub use value::{field_map, FieldMap, Value};
