pub mod action;
pub mod adapter;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod io;
pub mod lease;
pub mod ledger;
pub mod paths;
pub mod queue;
pub mod store;

pub use error::{Result, TickdError};
