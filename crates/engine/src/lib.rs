pub mod campaign;
pub mod contacts;
pub mod dead_letter;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod processor;
pub mod retry;
pub mod template;
pub mod timing;

#[cfg(test)]
pub(crate) mod testing;

pub use error::DeliveryError;
pub use processor::{JobOutcome, JobProcessor};
