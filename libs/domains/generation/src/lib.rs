//! Generation domain: the request parameter plane and the inference
//! runtime client.
//!
//! This crate provides:
//! - `GenerateRequest` - validated, normalized user parameters
//! - `inject_parameters` - the fixed parameter -> node-field mapping that
//!   writes user parameters into a workflow graph
//! - `InferenceClient` - submit / status / wait-and-download against a
//!   running inference container

pub mod client;
pub mod error;
pub mod inject;
pub mod params;

pub use client::{CompletionOutcome, InferenceClient, RuntimeState, RuntimeStatus};
pub use error::GenerationError;
pub use inject::inject_parameters;
pub use params::{resolve_seed, GenerateRequest, SamplerName, Scheduler};
