//! Weaver - a coordination core for multi-agent work streams.
//!
//! This crate provides the core library functionality for Weaver.

pub mod cli;
pub mod core;
pub mod server;
pub mod storage;
