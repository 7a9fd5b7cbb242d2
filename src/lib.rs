//! Scheduled PostgreSQL backups with object-store upload, restore
//! verification and tiered retention.

pub mod api;
pub mod config;
pub mod database;
pub mod db;
