//! Internal tests module
//!
//! Multi-engine scenarios over the loopback fabric, with full access to crate internals.

mod scenarios;
