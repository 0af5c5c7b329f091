pub mod cli;
pub mod config;
pub mod embed;
pub mod index;
mod metrics;
pub mod model;
pub mod server;

pub use config::Opts;
pub use embed::Embedder;
pub use index::{IndexPaths, MovieIndex, SearchHit};
pub use model::ClipEncoder;
