//! Transaction-proof reconciliation and multi-client sync for SACCO clients

pub mod api;
pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod feed;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
