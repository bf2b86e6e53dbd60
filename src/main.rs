use std::{path::PathBuf, sync::Arc};

use yta_resilient::{config::Config, orchestrator::Orchestrator, transport::ReqwestTransport};

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Read video id and optional codec from args
    let video_id = std::env::args().nth(1).expect("No video id provided");
    let codec = std::env::args().nth(2);

    let mut config = Config::default();
    if let Ok(dir) = std::env::var("YTA_STATE_DIR") {
        config.state_dir = PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("YTA_OUTPUT_DIR") {
        config.download.output_dir = PathBuf::from(dir);
    }
    config.session.proxy = std::env::var("YTA_PROXY").ok();
    config.session.mobile = env_flag("YTA_MOBILE");

    let transport = Arc::new(ReqwestTransport::new(&config.session));
    let orchestrator = Orchestrator::new(config, transport)
        .await
        .expect("Could not open job state");

    match orchestrator.resume_incomplete_jobs().await {
        Ok(report) => {
            for (job_id, path) in &report.completed {
                println!("Resumed {} -> {}", job_id, path.display());
            }
            for (job_id, e) in &report.failed {
                eprintln!("Could not resume {}: {}", job_id, e);
            }
            for job_id in &report.stale {
                eprintln!("Job {} lost its partial file, left in place", job_id);
            }
        }
        Err(e) => eprintln!("Could not list incomplete jobs: {}", e),
    }

    match orchestrator
        .extract_and_download(&video_id, codec.as_deref())
        .await
    {
        Ok(outcome) => println!("Done: {}", outcome.path.display()),
        Err(e) => {
            let risk = orchestrator.risk();
            eprintln!(
                "Download failed: {} (risk {:?}, score {:.2})",
                e, risk.level, risk.score
            );
            std::process::exit(1);
        }
    }
}
