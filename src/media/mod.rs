// External media tool plumbing
//
// - template: command templates, placeholder substitution, overrides, quoting
// - commands: resolved command representation and builders
// - executor: running the tool and interpreting its exit
// - probe: ffprobe invocation and JSON parsing

pub mod commands;
pub mod executor;
pub mod probe;
pub mod template;

use std::sync::Arc;

pub use commands::*;
pub use executor::*;
pub use probe::*;
pub use template::*;

use crate::config::MediaConfig;

/// Factory for the tool runners used by the orchestrator
pub struct MediaToolFactory;

impl MediaToolFactory {
    /// Create the default executor implementation (tokio subprocesses)
    pub fn create_executor() -> Arc<dyn ProcessExecutor> {
        Arc::new(TokioProcessExecutor::new())
    }

    /// Create the default probe implementation (ffprobe)
    pub fn create_probe(config: &MediaConfig) -> Arc<dyn MediaProbe> {
        Arc::new(FfprobeProbe::new(config.probe_binary_path.clone(), config.timeout()))
    }
}
