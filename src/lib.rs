#![allow(clippy::manual_unwrap_or_default)]

pub mod accumulator;
pub mod auth;
pub mod client;
pub mod constants;
pub mod decoder;
pub mod hardening;
pub mod logging;
pub mod main_helper;
pub mod normalizer;
pub mod scheduler;
pub mod store;
pub mod str_utils;
pub mod streaming;
pub mod types;

pub use types::*;

pub use client::{ChatClient, ChatThread, ClientConfig};
pub use main_helper::{AppState, Args};
pub use streaming::{CancelHandle, CancelPolicy, StreamController, StreamState, TurnOutcome};
