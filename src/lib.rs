//! camstream - on-demand stream sessions for battery-powered cameras
//!
//! Wakes a sleeping camera through its base station, runs an RTSP receiver
//! pipeline onto an ephemeral local port, and keeps it alive for as long as
//! clients keep refreshing the session.

pub mod camera;
pub mod config;
pub mod error;
pub mod events;
pub mod state;
pub mod stream;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
