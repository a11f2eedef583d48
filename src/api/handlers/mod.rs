pub mod auth;
pub mod csrf;
pub mod health;
pub mod types;
