use replay::TokenStats;
use replay::bucket::distribution;
use replay::trace::{COL_CONTEXT_TOKENS, COL_GENERATED_TOKENS, read_rows};

use crate::config::{BucketsArgs, TraceSettings};
use crate::error::CliError;

pub fn run(args: &BucketsArgs) -> Result<(), CliError> {
    let settings = TraceSettings::new(&args.trace)?;
    let rows = read_rows(&settings.trace)?;
    tracing::info!(path = %settings.trace.display(), rows = rows.len(), "loaded trace");

    let context: Vec<f64> = rows.iter().map(|r| r.context_tokens as f64).collect();
    let generated: Vec<f64> = rows.iter().map(|r| r.generated_tokens as f64).collect();

    println!("Token statistics ({} rows)", rows.len());
    print_stats(COL_CONTEXT_TOKENS, &TokenStats::from_values(&context)?);
    print_stats(COL_GENERATED_TOKENS, &TokenStats::from_values(&generated)?);
    println!();

    let classifier = settings.buckets.build(&context)?;
    println!("Buckets by {COL_CONTEXT_TOKENS}");
    for line in classifier.thresholds() {
        println!("  {line}");
    }
    println!();

    let total = context.len();
    for (label, count) in distribution(classifier.as_ref(), &context)? {
        let share = 100.0 * count as f64 / total as f64;
        println!("  {label:>8} : {count:>8}  {share:5.1}%");
    }

    Ok(())
}

fn print_stats(name: &str, s: &TokenStats) {
    println!(
        "  {name:<16} mean {:>9.1}  std {:>9.1}  min {:>7}  25% {:>7}  50% {:>7}  75% {:>7}  max {:>7}",
        s.mean, s.std, s.min, s.p25, s.p50, s.p75, s.max
    );
}
