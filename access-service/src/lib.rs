pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod startup;

pub use error::AccessError;
pub use startup::{build_router, AppState, Application};
