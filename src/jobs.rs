//! Running, submitting and tracking jobs.

pub mod store;
pub use store::*;

mod listeners;
pub use listeners::*;

mod exec;
pub use exec::*;
