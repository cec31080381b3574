#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod fuse;
pub mod loader;
pub mod locks;
pub mod overlay;
pub mod path;
pub mod tombstone;
pub mod writeback;

pub use error::{CacheFsError, Result};
pub use overlay::CacheFs;
