pub mod agent;
pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod evaluate;
pub mod graph;
pub mod memory;
pub mod message;
pub mod model;
pub mod parser;
pub mod prompts;
pub mod provider;
pub mod roster;
pub mod team;
pub mod telemetry;
pub mod tools;
