//! crew Daemon - Agent session registry, launcher and socket server
//!
//! This crate provides the core infrastructure for the crew daemon:
//! - `launcher` - Builds agent invocations, finds the binary, spawns processes
//! - `registry` - One actor per session owning its cache, queue and subscribers
//! - `server` - Unix socket server for client connections
//! - `history` - Read-only access to the agent's stored conversations
//! - `config` - Persistent daemon settings
//! - `cli` - The `crewd` command line
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        crewd daemon                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│      RegistryHandle         │   │
//! │  │ (Unix Socket)   │     │  (index: key → session)     │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ SessionCommand    │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│◀────│  SessionActor (per session) │   │
//! │  │  (per client)   │ evt │  ◀── attachment ── agent    │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod cli;
pub mod config;
pub mod history;
pub mod launcher;
pub mod registry;
pub mod server;
