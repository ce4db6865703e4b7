//! Open Cloud Mesh (OCM) federation protocol core.
//!
//! This crate implements the federation protocol core described in the project
//! specification: the inbound request pipeline (declared-peer extraction, HTTP
//! message signature verification, policy evaluation), the outbound pipeline
//! (discovery, signing, SSRF-hardened HTTP client), the federation membership
//! engine, and the share/invite/notification/token state machines. HTTP routing,
//! TLS listener setup and session/party storage are implemented as thin
//! collaborators in [`http`] and [`auth`] so the crate is runnable end to end,
//! but the protocol semantics live in the component modules below.

pub mod auth;
pub mod cache;
pub mod config;
pub mod discovery;
pub mod error;
pub mod federation;
pub mod http;
pub mod http_client;
pub mod invites;
pub mod peers;
pub mod policy;
pub mod shares;
pub mod signature;
pub mod state;
pub mod verifier;
pub mod webdav;
