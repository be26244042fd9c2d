//! Virtual-user load harness for the coin-transfer shop API.
//!
//! A run ramps simulated users up and down according to a list of
//! [stages](logical::Stage). Every user repeats the same script
//! (authenticate, buy an item, maybe send a coin to somebody already
//! registered, pause) and every request outcome is streamed into the
//! [evaluator](evaluator::Evaluator), which decides whether the configured
//! [thresholds](threshold::Threshold) held.

pub mod client;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod logical;
pub mod registry;
pub mod report;
pub mod runner;
pub mod threshold;
pub mod user;

#[cfg(test)]
mod test_util;

pub use crate::logical::{Executor, Stage};
pub use config::Config;
pub use runner::Runner;
pub use user::User;

pub type UserResult = Result<(), error::Error>;

pub use futures_channel::mpsc::unbounded as channel;
pub use futures_channel::mpsc::UnboundedReceiver as Receiver;
pub use futures_channel::mpsc::UnboundedSender as Sender;

pub(crate) const CRATE_NAME: &str = "coinload";
pub(crate) const USER_TASK: &str = "coinload::user";
pub(crate) const SPAN_EXEC: &str = "execution";
pub(crate) const SPAN_TASK: &str = "task";
