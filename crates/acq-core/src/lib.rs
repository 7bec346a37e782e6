//! Core types and traits for the raster acquisition engine.
//!
//! This crate holds the leaf layer of the acquisition stack: the typed
//! N-dimensional [`DataArray`](data::DataArray) with its metadata bundle,
//! the [`DataFlow`](flow::DataFlow) multicast channel and
//! [`SyncEvent`](flow::SyncEvent) rendezvous primitive, the error taxonomy,
//! and the hardware capability traits ([`Emitter`](hw::Emitter),
//! [`Detector`](hw::Detector), [`Actuator`](hw::Actuator)) that device
//! drivers implement and the engine consumes.

pub mod data;
pub mod error;
pub mod flow;
pub mod hw;
pub mod metadata;

pub use data::{DataArray, Dtype, DynArray};
pub use error::{AcqError, AcqResult};
pub use flow::{DataFlow, SubscriptionToken, SyncEvent};
pub use metadata::Metadata;
