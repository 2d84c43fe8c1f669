#![forbid(unsafe_code)]
#![deny(unused_must_use, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![warn(missing_docs, unreachable_pub, clippy::all, clippy::pedantic, clippy::nursery)]

//! `ferry <config.json> <job-id> <source> <destination> [<source> <destination> ...]`
//!
//! Submits every pair as one job, waits for it to finish, and prints the
//! outcome. Exits non-zero when any transfer failed.

use std::path::PathBuf;
use std::time::Duration;

use ferry_app::{
    AppError, AppResult, Generator, JobStatus, Services, current_user, init_logging, load_config,
};
use ferry_core::DEFAULT_PRIORITY;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Invocation {
    config: PathBuf,
    job_id: String,
    pairs: Vec<(String, String)>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> AppResult<Invocation> {
    let mut args = args.into_iter().skip(1);
    let config = args.next().map(PathBuf::from).ok_or(AppError::Usage {
        reason: "missing configuration path",
    })?;
    let job_id = args.next().ok_or(AppError::Usage {
        reason: "missing job id",
    })?;
    let rest: Vec<String> = args.collect();
    if rest.is_empty() || rest.len() % 2 != 0 {
        return Err(AppError::Usage {
            reason: "expected source and destination pairs",
        });
    }
    let pairs = rest
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    Ok(Invocation {
        config,
        job_id,
        pairs,
    })
}

/// Cancel `job_id` after an interrupt.
///
/// Returns the error to finish with when the scheduler has already stopped
/// and no further completions will arrive.
fn interrupt(generator: &Generator, job_id: &str) -> Option<String> {
    if generator.cancel_job(job_id) {
        return None;
    }
    warn!(job_id, "cancellation refused; scheduler already stopped");
    Some(format!(
        "cancellation of job {job_id} refused: scheduler already stopped"
    ))
}

/// Runs one job to completion.
#[tokio::main]
async fn main() -> AppResult<()> {
    let invocation = parse_args(std::env::args())?;
    let config = load_config(Some(&invocation.config)).await?;
    init_logging(&config)?;
    let services = Services::from_config(config)?;
    let user = current_user()?;

    for (source, destination) in &invocation.pairs {
        let accepted = services
            .generator
            .add_request(&user, source, destination, &invocation.job_id, DEFAULT_PRIORITY)
            .await;
        if !accepted {
            services.shutdown(true).await?;
            return Err(AppError::Rejected {
                job_id: invocation.job_id,
                source_url: source.clone(),
            });
        }
    }
    info!(job_id = %invocation.job_id, requests = invocation.pairs.len(), "job submitted");

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let errors = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let JobStatus::Finished { error } = services.generator.query_finished(&invocation.job_id) {
                    break error;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(job_id = %invocation.job_id, "interrupted, cancelling job");
                if let Some(error) = interrupt(&services.generator, &invocation.job_id) {
                    break error;
                }
            }
        }
    };
    services.shutdown(false).await?;

    if errors.is_empty() {
        println!("{}: finished", invocation.job_id);
        Ok(())
    } else {
        println!("{}: failed: {errors}", invocation.job_id);
        Err(AppError::JobFailed {
            job_id: invocation.job_id,
            errors,
        })
    }
}
