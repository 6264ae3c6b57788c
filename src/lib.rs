pub mod config;
pub mod controller;
pub mod error;
pub mod repo;
pub mod simulation;
pub mod telemetry;
