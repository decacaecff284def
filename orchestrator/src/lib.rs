pub mod config;
pub mod error;
mod session;

pub use config::{NodePlan, PipelineConfig, StageConfig};
pub use error::OrchestratorError;
pub use session::Session;

/// Reaches every node named by `config`, creates its stages and returns a
/// session ready to run batches.
///
/// # Errors
/// Returns an `OrchestratorError` if the config is invalid or setting up any
/// node fails.
pub fn connect(config: &PipelineConfig) -> Result<Session, OrchestratorError> {
    let plans = config.placement()?;
    log::info!(
        "connecting to {} node(s) hosting {} stage(s)",
        plans.len(),
        config.stages.len()
    );
    Session::new(plans, config.run.clone())
}
