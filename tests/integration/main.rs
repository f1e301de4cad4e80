//! Integration tests for the journal service
//!
//! Every scenario runs against the in-process coordination client and
//! tempdir-backed NFS directories, driving the same code paths the deployed
//! binaries use: the axum router, the failover facade, and the worker loops
//! (one iteration at a time).

mod common;
mod failover;
mod http_api;
mod lifecycle;
