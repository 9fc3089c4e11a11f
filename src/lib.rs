// Configuration (TOML file + defaults)
pub mod config;

// Topic rules, partition keys and topic routing
pub mod rule;

// Payload extraction into typed values
pub mod extract;

// Storage backends (Postgres, in-memory)
pub mod store;

// Change detection and persistence pipeline
pub mod pipeline;

// MQTT subscription dispatcher
pub mod mqtt;

// Structured fatal-error signal
pub mod error;
