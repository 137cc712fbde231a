//! # Tessera (credential and session lifecycle engine)
//!
//! `tessera` registers principals, verifies passwords and an optional TOTP
//! second factor, and issues short-lived access tokens paired with
//! rotating refresh tokens.
//!
//! ## Refresh rotation
//!
//! Every refresh token is a node in a per-device chain. Presenting an active
//! token revokes it and links it to a freshly minted successor in one atomic
//! step. Presenting a token that was already rotated is treated as theft: the
//! whole chain, including the current leaf, is revoked and the caller gets
//! `TokenReuseDetected`.
//!
//! ## Layout
//!
//! - [`auth`]: the engine (credentials, tokens, rotation, second factor, sweeping).
//! - [`store`]: storage traits with in-memory and Postgres backends.
//! - [`api`]: an axum adapter exposing the engine over HTTP.
//! - [`cli`]: argument parsing, telemetry and the server action.

pub mod api;
pub mod auth;
pub mod cli;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
