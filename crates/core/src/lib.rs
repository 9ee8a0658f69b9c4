//! Domain model for the dream image-generation service.
//!
//! Pure value types only: the [`request::GenerationRequest`] data model,
//! the [`sampler::Sampler`] enum, and shared error types. No I/O, no
//! async, no dependency on the engine or transport layers.

pub mod error;
pub mod request;
pub mod sampler;
