pub mod config;
pub mod control;
pub mod logger;
pub mod reporter;
