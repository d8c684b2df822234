pub mod bouncer;
pub mod cli;
pub mod cloudflare;
pub mod config;
pub mod crowdsec;
pub mod defaults;
pub mod event;
pub mod http;
pub mod infra;
pub mod metrics;
pub mod reconciler;
pub mod turnstile;
pub mod utils;
