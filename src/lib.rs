//! Ralphy - an autonomous task-execution orchestrator that drives an
//! external AI engine CLI.
//!
//! This crate provides the execution kernel: the task state machine,
//! the priority queue, the file lock manager, the retry and circuit
//! breaker policy, the content-addressed file cache, the planning
//! cache, and the engine subprocess adapter.

pub mod adapters;
pub mod cli;
pub mod core;
pub mod orchestrator;
pub mod queue;
pub mod source;
pub mod storage;
