pub mod communication;
pub mod config;
pub mod control_system;
pub mod data_structures;
pub mod engine;
pub mod errors;
pub mod global_variables;
pub mod monitoring;
pub mod optimizer;
pub mod sensors;
pub mod shared_data;
