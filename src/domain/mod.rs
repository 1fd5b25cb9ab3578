pub mod capability;
pub mod error;
pub mod models;
pub mod settings;
