pub mod auth;
pub mod db;
pub mod error;
pub mod models;
pub mod ownership;

pub use error::{Error, Result};
