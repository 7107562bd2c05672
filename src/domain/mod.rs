pub mod controller;
pub mod error;
pub mod models;
pub mod session;
pub mod settings;
