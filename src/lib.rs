//! Signup engine — onboarding stage progression over libSQL.

pub mod auth;
pub mod config;
pub mod error;
pub mod notify;
pub mod onboarding;
pub mod store;
