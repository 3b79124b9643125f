pub mod config;
pub mod engine;
pub mod sessions;

pub use config::*;
pub use engine::*;
pub use sessions::*;
