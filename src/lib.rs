pub mod config;
pub mod error;
pub mod generator;
pub mod models;
pub mod pipeline;
pub mod schedulers;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export common types
pub use config::{load_config, GenerationConfig, OutputType, Prompt, PromptInput};
pub use error::{PipelineError, Result};
pub use generator::NoiseGenerator;
pub use pipeline::{GeneratedImages, InitImage, PipelineOutput, StableDiffusionPipeline};
pub use schedulers::{NoiseScheduleConfig, Scheduler, SchedulerKind};

pub mod logging {
    use env_logger::{Builder, Env};
    use std::io::Write;

    /// Timestamped logger at `info`, overridable through `RUST_LOG`.
    pub fn init_logger() {
        Builder::from_env(Env::default().default_filter_or("info"))
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .try_init()
            .ok();
    }
}
