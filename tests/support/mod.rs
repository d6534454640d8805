//! Helpers shared by the integration tests.

#![allow(dead_code)]

pub mod fixtures;
pub mod socket_guard;
pub mod stall_server;
