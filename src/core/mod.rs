pub mod errors;

pub use errors::{Result, StoreError, TaskerError};
