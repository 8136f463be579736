//! Pipeline engine, cache store and tree discovery.
//!
//! # Overview
//!
//! A run consists of:
//! - **Discovery**: mirror the source directory into an [`AssetTree`](crate::asset::AssetTree)
//! - **Stages**: run every pipe in declared order over the tree
//! - **Output**: write the final leaves and delete outputs that went stale
//!
//! # Example
//!
//! ```ignore
//! use assetpipe::build::{BuildContext, PipelineEngine};
//! use assetpipe::pipes;
//!
//! let context = BuildContext::new("assets", "public");
//! let mut engine = PipelineEngine::new(context, pipes::default_pipes())?;
//!
//! let result = engine.build()?;
//! println!("{}", result.summary());
//! ```

pub mod cache;
pub mod context;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod result;

pub use cache::*;
pub use context::*;
pub use discovery::*;
pub use engine::*;
pub use error::*;
pub use result::*;
