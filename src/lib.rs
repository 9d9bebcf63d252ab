//! Tamper-evident, append-only audit ledger for the voting service.
//!
//! [`ledger`] holds the hash-linked chain and can be embedded on its own;
//! [`api`] serves it over HTTP.

pub mod api;
pub mod config;
pub mod ledger;
