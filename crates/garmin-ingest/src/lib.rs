pub mod cli;
pub mod client;
pub mod config;
pub mod decode;
pub mod error;
pub mod models;
pub mod normalize;
pub mod source;
pub mod storage;
pub mod sync;

pub use error::{IngestError, Result};
