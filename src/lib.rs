//! jobmail: groups a tradie's mailbox into projects.
//!
//! The pipeline: change detection (push subscriptions with a polling
//! fallback) feeds a durable notification queue; a fetch/parse stage hands
//! messages to the AI queue; entity extraction and deterministic project
//! resolution write mappings; labels reflect back to the provider; user
//! corrections feed learned patterns back into the resolver.

pub mod attachments;
pub mod categorize;
pub mod config;
pub mod corrections;
pub mod db;
pub mod error;
pub mod events;
pub mod extractor;
pub mod gmail;
pub mod http;
pub mod labels;
pub mod learning;
mod migrations;
pub mod normalize;
pub mod queue;
pub mod rate_limit;
pub mod resolver;
pub mod scheduler;
pub mod state;
pub mod util;
pub mod watch;
pub mod workers;
