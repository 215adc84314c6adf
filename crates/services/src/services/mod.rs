//! Service layer: integration providers and the background machinery that
//! keeps feedback in sync with them.

pub mod customer_resolver;
pub mod health_monitor;
pub mod integration_processor;
pub mod integrations;
pub mod oauth_connection;
