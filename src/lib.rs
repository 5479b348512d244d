//! HarajPlus API client
//!
//! Authenticated access to the HarajPlus marketplace API with transparent,
//! single-flight access token renewal.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
