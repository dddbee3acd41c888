//! ISAAC+ consensus node: a permissioned BFT ledger that agrees on one
//! block per height through INIT and ACCEPT voting rounds.

pub mod base;
pub mod block;
pub mod config;
pub mod consensus;
pub mod error;
pub mod logger;
pub mod network;
pub mod state;
pub mod storage;
