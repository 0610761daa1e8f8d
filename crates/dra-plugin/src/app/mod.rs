//! Application module
//!
//! Wires the preparation engine, inventory refresher and healthcheck server
//! into one process and drives their lifecycle.

pub mod builder;
pub mod core;
pub mod services;
pub mod tasks;

pub use builder::ApplicationBuilder;
pub use self::core::Application;
pub use services::ApplicationServices;
