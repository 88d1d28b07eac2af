pub mod core;
pub mod settings;
pub mod stats;
pub mod students;
