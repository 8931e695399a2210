use anyhow::Result;
use tracing::info;
use uuid::Uuid;

use tracepoint_judge::config::{self, EngineConfig};
use tracepoint_judge::{run_submission, ProcessExecutor};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries exactly one verdict document.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracepoint_judge=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    config::init_config(EngineConfig::from_env())?;
    let engine_config = config::get_config();
    info!(
        "Engine config: binary={}, image={}, restore_timeout={}s, test_timeout={}s",
        engine_config.sandbox_binary,
        engine_config.image,
        engine_config.restore_timeout_secs,
        engine_config.test_timeout_secs
    );

    // `--keep` (any case) retains the workspace; everything else is ignored.
    let keep = std::env::args()
        .skip(1)
        .any(|arg| arg.eq_ignore_ascii_case("--keep"));

    let submission_id = Uuid::new_v4().simple().to_string();
    info!("Judging submission {}", submission_id);

    let (verdict, exit_code) = run_submission(&ProcessExecutor, &submission_id, keep).await;

    println!("{}", verdict);
    std::process::exit(exit_code);
}
