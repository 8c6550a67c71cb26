// Wire protocol, connection registry and subscription state machine
pub mod subscription;

// GraphQL execution seam and schema registry
pub mod engine;

// Server host: manager task, listener, lifecycle
pub mod server;

// WebSocket routes and health endpoint
pub mod api;

// Producer-side event injection
pub mod publisher;

// TOML + environment configuration
pub mod config;

// Example chat schema and filters
pub mod demo;
