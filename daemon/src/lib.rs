pub mod actuator;
pub mod arg_parser;
pub mod benchmark_service;
pub mod config;
pub mod errors;
pub mod gpu_device;
pub mod host;
pub mod logger;
pub mod rpc;
pub mod sample;
pub mod sensors;
pub mod store;
pub mod supervisor;
pub mod telemetry;
