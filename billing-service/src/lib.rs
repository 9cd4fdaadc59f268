//! billing-service: provisioning action queue, invoice ledger and overdue sweeper.

pub mod config;
pub mod gateways;
pub mod models;
pub mod provisioning;
pub mod services;
pub mod startup;
pub mod workers;
