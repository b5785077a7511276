use telemetry_harness::{HarnessBuilder, HarnessError};

const DEFAULT_CONFIG_FILE: &str = "telemetry-harness.toml";

fn main() -> Result<(), HarnessError> {
    let config_file = std::env::var("TELEMETRY_HARNESS_CONFIG")
        .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

    // tonic spawns its channel worker onto the ambient runtime; the HTTP
    // exporters and the health probe block on their own threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(HarnessError::Runtime)?;
    let _entered = runtime.enter();

    HarnessBuilder::new()
        .with_file(&config_file)
        .with_env("HARNESS_")
        .with_standard_env()
        .build()?
        .run()
}
