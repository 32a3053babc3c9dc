pub mod command;
pub mod error;
pub mod models;
pub mod settings;
pub mod state;
