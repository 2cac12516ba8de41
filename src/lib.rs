//! ffbatch - batch accumulation and execution of ffmpeg jobs
//!
//! Files arrive one invocation at a time and are collected per job key until a
//! batch is complete. The batch is then turned into a command from a template,
//! run through the external tool, and every temporary file is removed again.

pub mod batch;
pub mod cli;
pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod scratch;
pub mod store;
