//! # vole-core
//!
//! Core types for the vole computation-graph engine.
//!
//! This crate provides:
//! - [`TensorShape`] / [`Dim`] — shape metadata propagated through a graph
//!   before any tensor is allocated
//! - [`Activations`] / [`Gradients`] — the bundles flowing along graph
//!   edges during forward and backward passes
//! - [`MemoryReport`] — pre-flight capacity estimates
//! - [`ParamLayout`] / [`ModelBuffers`] — the flat parameter and gradient
//!   buffers shared by all parametrized layers via sub-range views
//! - [`Error`] / [`Result`] — the error taxonomy used throughout vole

pub mod activations;
pub mod buffer;
pub mod error;
pub mod memory;
pub mod shape;

pub use activations::{Activations, Gradients, MaskState, Slot};
pub use buffer::{ModelBuffers, ParamLayout, ParamSpan};
pub use error::{Error, Result};
pub use memory::{MemoryReport, ELEM_BYTES};
pub use shape::{Dim, TensorShape};
