//! Offline-aware cached state, local mirror and sync queue for the Sisa
//! business client.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod offline;
pub mod sync;
