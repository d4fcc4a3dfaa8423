//! Deferred-persistence sink for generated images.
//!
//! A node either writes every image straight to the output folder, or stages
//! previews in the temp folder and commits them later through the manual-save
//! endpoint. Counter suffixes stay collision-free across both paths.

pub mod api;
pub mod config;
pub mod counter;
pub mod error;
pub mod frame;
pub mod io;
pub mod metadata;
pub mod paths;
pub mod sink;
pub mod widget;

pub use error::{SinkError, SinkResult};
pub use sink::{ImageSink, SaveMode};
