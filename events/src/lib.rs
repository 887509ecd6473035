//! Event system infrastructure for FoodShare realtime.
//!
//! This crate provides the typed event bus that sits between the realtime
//! transport and the application code consuming row changes.
//!
//! # Architecture
//!
//! - **ChangePayload**: a single row change (insert, update, delete) as
//!   delivered by the realtime service
//! - **EventHandler**: trait implemented by anything that consumes events
//! - **EventBus**: fans events out to registered handlers with per-handler
//!   error isolation
//!
//! This crate has no dependencies on other internal crates, so the transport
//! layer and the UI-facing layer can both depend on it without cycles. Row
//! data is carried as `serde_json::Value`.

pub mod bus;
pub mod payload;

pub use bus::{EventBus, EventHandler, HandlerError, PublishReport, SubscriberId};
pub use payload::{ChangeKind, ChangePayload, EventSelector, ParseSelectorError};
