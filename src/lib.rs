//! Coil - terminal AI coding assistant, agent inference core
//!
//! Coil turns a user message into a completed assistant response by
//! streaming from an LLM provider, dispatching tools on the model's behalf
//! behind a human-in-the-loop permission gate, and persisting every
//! intermediate state so a UI can follow along over the event bus.

pub mod agent;
pub mod bus;
pub mod cli;
pub mod config;
pub mod db;
pub mod message;
pub mod permission;
pub mod provider;
pub mod session;
pub mod tool;
