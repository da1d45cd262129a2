//! Repositories built on the key-value driver

pub mod runs;
pub mod sessions;
pub mod trades;

pub use runs::*;
pub use sessions::*;
pub use trades::*;
