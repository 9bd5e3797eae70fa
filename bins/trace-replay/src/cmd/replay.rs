use tokio_util::sync::CancellationToken;

use replay::{ReportStatus, load_trace, session};

use crate::config::{Effective, ReplayArgs};
use crate::error::CliError;

pub async fn run(args: &ReplayArgs) -> Result<(), CliError> {
    let eff = Effective::new(args)?;

    // --- Load trace ---
    let loaded = load_trace(&eff.trace.trace, &eff.prompts, &eff.trace.buckets, eff.limit)?;

    let cfg = &eff.replay;
    println!("Trace Replay");
    println!("  target  : {}", cfg.dispatch_url());
    println!("  events  : {} of {} rows", loaded.events.len(), loaded.total_rows);
    println!("  mode    : {}", cfg.mode);
    println!("  pacing  : {}", cfg.pacing);
    println!("  scale   : {}", cfg.scale);
    if let Some(ref out) = cfg.output {
        println!("  output  : {}", out.display());
    }
    println!();

    // --- Replay, Ctrl+C cancels and keeps partial results ---
    let token = CancellationToken::new();
    let replay = session::run(&loaded.events, cfg, token.clone());
    tokio::pin!(replay);

    let result = tokio::select! {
        result = &mut replay => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::warn!("interrupted, stopping replay");
            token.cancel();
            replay.await
        }
    };
    let run = result?;

    println!("{}", run.summary);
    match run.report {
        ReportStatus::Written { path, rows } => {
            println!("  report  : {} ({rows} rows)", path.display());
        }
        ReportStatus::Skipped(reason) => tracing::debug!(reason, "report not written"),
        ReportStatus::Failed(e) => eprintln!("Warning: {e}"),
    }

    Ok(())
}
