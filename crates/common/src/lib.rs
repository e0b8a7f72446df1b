pub mod config;
pub mod connect;
pub mod db;
pub mod error;
pub mod health;
pub mod redis_pool;
pub mod types;
