pub mod control;
pub mod gateway_config;
pub mod process;
pub mod session;
pub mod settings;
