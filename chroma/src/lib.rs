//! Chroma-key transparency for images rendered against a green screen.
//!
//! The pipeline is decode → [`filter::apply`] → encode; [`key_out`] runs all
//! three steps on an in-memory buffer.

pub mod codec;
pub mod error;
pub mod filter;

pub use codec::{decode, encode, PixelGrid};
pub use error::ChromaError;
pub use filter::{apply, key_out, ChromaKeyConfig};
