pub mod bpdt;
pub mod cmd;
pub mod cpd;
pub mod db;
pub mod diag;
pub mod engine;
pub mod error;
pub mod ext;
pub mod extract;
pub mod fpt;
pub mod guid;
pub mod huffman;
pub mod manifest;
pub mod resolve;
pub mod scan;
pub mod uncharted;
pub mod verify;
pub mod view;

// Re-export the entry points used by integration tests and embedders
pub use crate::engine::{Analysis, analyze, extract_image};
pub use crate::error::{DecodeError, DecodeResult};
pub use crate::scan::Scanner;
