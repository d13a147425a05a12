//! nxclaw — a persistent, autonomous agent runtime.
//!
//! One process accepts natural-language requests from chat channels, the
//! web dashboard, and an internal self-scheduler; dispatches each request
//! to an LLM agent session with tools (shell, browser, memory,
//! objectives); and keeps durable continuity across restarts through a
//! file-backed memory hierarchy.
//!
//! Subsystem map:
//! - [`lanes`] — per-conversation FIFO scheduler with global backpressure
//! - [`tasks`] — background process supervision with retries and schedules
//! - [`memory`] — raw log, markdown tiers, hybrid text+vector retrieval
//! - [`objectives`] — durable priority queue of standing goals
//! - [`chrome`] — multi-session browser pool over the DevTools protocol
//! - [`runtime`] — the orchestrator tying it together, plus the
//!   autonomous loop
//! - [`channels`] — request intake surface and the dashboard HTTP API
//! - [`skills`] — installable prompt extensions

pub mod agent;
pub mod channels;
pub mod chrome;
pub mod config;
pub mod events;
pub mod fsutil;
pub mod lanes;
pub mod llm;
pub mod memory;
pub mod objectives;
pub mod runtime;
pub mod skills;
pub mod tasks;
pub mod tools;
