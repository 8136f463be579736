//! assetpipe - Incremental asset build pipeline
//!
//! This library provides functionality to:
//! - Parse `{tag}` annotations from file and folder names
//! - Model a source tree and the entries each transform stage derives from it
//! - Run an ordered list of pipes over the tree with a content-hash cache
//! - Keep an output directory in sync with the tree, incrementally in watch mode

pub mod asset;
pub mod atlas;
pub mod build;
pub mod cli;
pub mod config;
pub mod pipe;
pub mod pipes;
pub mod tags;
pub mod watch;
