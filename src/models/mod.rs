//! Data models for HarajPlus entities

mod user;

pub use user::*;
