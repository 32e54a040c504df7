//! Provider backend abstraction

pub mod traits;

pub use traits::*;
