//! Core crate for the pixlift image enhancement service.

pub mod accel;
pub mod codec;
pub mod config;
pub mod enhancer;
pub mod error;
pub mod logging;
pub mod models;
pub mod server;
