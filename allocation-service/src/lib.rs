//! Allocation Service - payment-to-invoice allocation ledger with drift reconciliation.

pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod startup;
