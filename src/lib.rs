pub mod api;
pub mod app;
pub mod config;
pub mod config_io;
pub mod engine;
pub mod fs;
pub mod logging;
pub mod pieces;
pub mod session;
pub mod single_instance;
