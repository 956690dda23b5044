pub mod config;
pub mod evaluate;
pub mod filter;
pub mod health;
pub mod policy;
