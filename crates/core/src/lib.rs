//! Shared configuration and error taxonomy for the huddle workspace.

pub mod config;
pub mod errors;

pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use errors::{ApplicationError, DomainError, InterfaceError};
