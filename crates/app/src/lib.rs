pub mod command;
pub mod error;
pub mod render;
pub mod settings;
pub mod shell;
