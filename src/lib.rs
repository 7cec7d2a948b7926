//! VDBOX command encoding and multi-pipe scheduling.
//!
//! Translates codec-level picture and tile parameters into hardware
//! command dwords for the HCP/VDENC video engines, sizes the buffers that
//! carry them, and spreads a frame across up to four pipes with GPU
//! semaphores where the pipes must meet.

pub mod cmdbuf;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod gen11;
pub mod gen12;
pub mod hcp;
pub mod mi;
pub mod packet;
pub mod protocol;
pub mod resource;
pub mod scalability;
pub mod sizer;
pub mod status_report;

pub use error::{MediaError, Result};
