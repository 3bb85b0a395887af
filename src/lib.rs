//! Tajwid Bot: course signup conversations with a referral program.

pub mod channels;
pub mod config;
pub mod error;
pub mod flow;
pub mod model;
pub mod public;
pub mod referral;
pub mod scheduler;
pub mod store;
pub mod subscription;
pub mod webhook;
