//! Device communication core for the CARTA companion.
//!
//! [`domain`] holds the session model, settings and the controller;
//! [`infrastructure`] holds the Bluetooth link, the transports and logging.

pub mod domain;
pub mod infrastructure;
