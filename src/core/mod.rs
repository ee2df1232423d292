pub mod config;
pub mod error;
pub mod io;
pub mod plan;
pub mod state;
pub mod store;
