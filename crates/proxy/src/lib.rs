//! Intercepting proxy engine for the five generations of a family of
//! client/server game protocols.
//!
//! The proxy terminates the client's encrypted session, opens a parallel
//! encrypted session to the remote server, and forwards framed commands in
//! both directions while rewriting identity-bearing fields, saving file
//! streams, synthesizing replies, and redirecting reconnects. A session is
//! *unlinked* until the client's login identifies it, then *linked*; linked
//! sessions survive client disconnects for a bounded idle window and can be
//! resumed across reconnects (a ship or block change goes through a full
//! reconnect back to one of our own ports).
//!
//! The crate exposes the engine only; config files, the control shell, and
//! process setup live in the runner binary.

pub mod cipher;
pub mod commands;
pub mod config;
pub mod error;
pub mod files;
pub mod frame;
pub mod lobby;
pub mod proxy;
pub mod services;
pub mod session;
pub mod subcommands;
pub mod version;
pub mod wire;
