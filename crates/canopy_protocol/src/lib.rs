//! # Canopy Protocol
//!
//! Streaming wire protocol types and codecs for Canopy.
//!
//! This crate provides:
//! - `Path` for hierarchical store locations
//! - `FrameReader` for the newline-delimited push-stream framing
//! - `StreamEvent` tagging of decoded frames
//! - `StreamUpdate` for reconciliation-layer consumption
//!
//! This is a pure protocol crate with no I/O operations. Bytes go in,
//! typed values come out; the engine owns connections and retries.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod frame;
mod path;
mod update;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{FrameReader, RawFrame, StreamEvent, UpdatePayload};
pub use path::Path;
pub use update::{Blob, StreamUpdate};
