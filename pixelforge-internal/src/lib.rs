// This is an internal crate, so we're the only consumers of
// traits with async fns for now.
#![expect(async_fn_in_trait)]

pub mod auth; // session and admin authentication
pub mod blocking_rules; // IP and fingerprint blocklist
pub mod config_parser; // gateway TOML config
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // app state, setup and extractors
pub mod identity; // caller identity resolution
pub mod ledger; // persistence for usage counters and point balances
pub mod model_table; // model pricing and access table
pub mod observability; // logs and metrics
pub mod points; // points ledger
pub mod providers; // external image generation providers
pub mod redis_client; // redis client
pub mod settlement; // post-generation accounting
mod testing;
pub mod usage_limit; // free quota tracking
