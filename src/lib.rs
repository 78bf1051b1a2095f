#![forbid(unsafe_code)]

// asr_stress library - concurrent load harness for streaming speech recognition servers

pub mod audio;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod protocol;
pub mod readiness;
pub mod report;
pub mod sampler;
pub mod streamer;
pub mod worker;
