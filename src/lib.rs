//! crystcap: vision-LLM caption annotation for crystallization phase
//! datasets.
//!
//! The pipeline enumerates phase-labeled microscopy images, requests
//! captions from a vision backend with bounded concurrency and retry,
//! scores each caption against the ground-truth phase, filters out weak
//! ones (with a regeneration budget), and exports the surviving entries as
//! a training dataset. An append-only checkpoint log makes interrupted runs
//! resumable.

pub mod checkpoint;
pub mod enumerator;
pub mod export;
pub mod filter;
pub mod models;
pub mod pipeline;
pub mod provider;
pub mod requester;
pub mod scorer;

pub use models::{Config, CrystcapError, Result};
pub use pipeline::AnnotatePipeline;
