//! Persistent plugin discovery cache used by the Cadenza module bank.

mod entry;
mod store_json;

pub use entry::*;
pub use store_json::*;
