//! Closed scheduler catalog.
//!
//! Maps identifier strings to algorithm constructors. Unknown identifiers
//! fail at configuration time with [`Error::UnknownScheduler`](crate::Error).

mod variant;

pub use variant::{parse_scheduler_id, SchedulerId};
