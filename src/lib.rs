//! SMS Cadence: delivery scheduling and conversation state engine.

pub mod api;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod delivery;
pub mod error;
pub mod event_log;
pub mod injector;
pub mod phone;
pub mod recipients;
pub mod store;
pub mod transport;
