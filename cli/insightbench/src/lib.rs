#![doc = include_str!("../README.md")]
//! `insightbench` drives fixed-concurrency load against Lambda functions, summarizes the
//! client-side latencies, and cross-checks them against CloudWatch Logs Insights.

pub mod aws_setup;
pub mod benchmark;
pub mod catalog;
pub mod config;
pub mod console;
pub mod driver;
pub mod insights;
pub mod lambda;
pub mod report;
pub mod sink;
pub mod stats;
pub mod types;
