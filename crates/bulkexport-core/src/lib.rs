#![deny(dead_code)]

pub mod config;
pub mod cursor;
pub mod error;
pub mod job;
pub mod traits;
pub mod types;

pub use cursor::{Cursor, CursorCodec, SortValue};
pub use error::{Error, Result};
