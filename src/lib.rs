//! Repo Sandbox - per-user working clones behind an HTTP API.
//!
//! Every request is checked twice before touching disk: the caller must own
//! the repository ([`ownership`]) and every client path must stay inside the
//! clone ([`path_guard`]).

pub mod config;
pub mod error;
pub mod files;
pub mod git;
pub mod http_server;
pub mod materializer;
pub mod ownership;
pub mod path_guard;
pub mod registry;
pub mod runner;
pub mod service;
pub mod session;
pub mod state;
