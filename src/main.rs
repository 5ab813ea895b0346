use colored::Colorize;
use std::process;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use afni_proc_bids::config::InputConfig;

fn main() {
    let config = InputConfig::build().unwrap_or_else(|err| {
        eprintln!(
            "Problem parsing arguments: {}",
            err.to_string().red().bold()
        );
        process::exit(err.exit_code());
    });

    // RUST_LOG wins over --log-level
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    println!(
        "{} {}",
        "afni_proc BIDS-App for running AFNI afni_proc.py on BIDS datasets.\n Version:"
            .cyan()
            .bold(),
        env!("CARGO_PKG_VERSION").cyan().bold()
    );
    println!(
        "✅ Configurations validated, starting {} analysis in {} mode...",
        if config.dry_run { "a dry-run" } else { "the" },
        config.exec_mode
    );

    match afni_proc_bids::run(config) {
        Ok(summary) => {
            let verb = if summary.dry_run { "Resolved" } else { "Processed" };
            println!(
                "{}",
                format!("✅ {} {} subject(s)", verb, summary.subjects.len())
                    .green()
                    .bold()
            );
        }
        Err(e) => {
            eprintln!("Application error: {}", e.to_string().red().bold());
            process::exit(e.exit_code());
        }
    }
}
