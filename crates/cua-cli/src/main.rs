//! `cua-cli` – the `cua_agent` binary.
//!
//! The front door of the stack. It:
//!
//! 1. Builds [`Settings`] from the environment and initialises structured
//!    logging (`RUST_LOG`, `CUA_LOG_FORMAT=json`, optional OTLP export).
//! 2. Loads the computer adapter (`--adapter`, then `CUA_ADAPTER`, then the
//!    platform default) and runs its permission health checks, exiting
//!    nonzero when the OS denies screen capture or accessibility access.
//! 3. Installs a Ctrl-C handler that flips the orchestrator's cancellation
//!    flag; the in-flight action finishes and the episode still persists.
//! 4. Prompts on stdin for user goals; a blank prompt exits cleanly.

use std::io::{BufRead, Write};
use std::sync::atomic::Ordering;

use colored::Colorize;
use tracing::{error, info, warn};

use cua_computer::load_computer;
use cua_runtime::{Orchestrator, SessionSummary, init_tracing};
use cua_types::Settings;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let settings = Settings::from_env();
    let _guard = init_tracing("cua_agent");

    let adapter = match parse_args(std::env::args().skip(1)) {
        Ok(adapter) => adapter,
        Err(message) => {
            eprintln!("{message}");
            return 2;
        }
    };

    print_banner();

    // ── Adapter + permission health checks ────────────────────────────────
    let computer = match load_computer(&settings, adapter.as_deref()) {
        Ok(computer) => computer,
        Err(err) => {
            error!(error = %err, "failed to load computer adapter");
            println!("{} {err}", "Error:".red().bold());
            return 1;
        }
    };
    println!(
        "  Adapter: {} ({})",
        computer.platform_name().bold(),
        computer.system_info().dimmed()
    );
    if let Err(err) = computer.run_health_checks(&settings) {
        error!(error = %err, "health check failed");
        println!("{} {err}", "Error:".red().bold());
        return 1;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start async runtime");
            return 1;
        }
    };

    let mut orchestrator = match Orchestrator::from_settings_with_computer(settings, computer) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!(error = %err, "failed to wire the agent");
            println!("{} {err}", "Error:".red().bold());
            return 1;
        }
    };

    // ── Ctrl-C: cancel the running session, keep the episode ──────────────
    let cancel = orchestrator.cancel_flag();
    if let Err(err) = ctrlc::set_handler(move || {
        println!();
        println!(
            "{}",
            "⚠  Ctrl-C received – finishing the in-flight action and persisting …"
                .yellow()
                .bold()
        );
        cancel.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %err, "failed to install Ctrl-C handler; cancellation unavailable");
    }

    // ── Prompt loop ───────────────────────────────────────────────────────
    loop {
        let Some(user_prompt) = read_prompt() else {
            info!("no prompt provided; exiting");
            println!("{}", "Goodbye.".green());
            return 0;
        };

        info!(prompt = %user_prompt, "starting session");
        match runtime.block_on(orchestrator.run_task(&user_prompt)) {
            Ok(summary) => print_summary(&summary),
            Err(err) => {
                error!(error = %err, "unrecoverable session error");
                println!("{} {err}", "Error:".red().bold());
                return 1;
            }
        }
    }
}

/// Parse `--adapter <name>` from the argument list.
fn parse_args(args: impl Iterator<Item = String>) -> Result<Option<String>, String> {
    let mut adapter = None;
    let mut args = args.peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--adapter" => match args.next() {
                Some(name) => adapter = Some(name),
                None => return Err("--adapter requires a value".to_string()),
            },
            "--help" | "-h" => {
                return Err("usage: cua_agent [--adapter <name>]".to_string());
            }
            other => {
                return Err(format!(
                    "unknown argument '{other}'; usage: cua_agent [--adapter <name>]"
                ));
            }
        }
    }
    Ok(adapter)
}

fn read_prompt() -> Option<String> {
    print!("\nEnter a prompt (blank to quit): ");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) => None, // EOF
        Ok(_) => {
            let trimmed = line.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(_) => None,
    }
}

fn print_summary(summary: &SessionSummary) {
    let outcome = summary
        .outcome
        .as_ref()
        .and_then(|o| serde_json::to_value(o).ok())
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    println!();
    println!("{}", "Session finished".bold().underline());
    println!("  Outcome  : {}", outcome.bold());
    println!("  Steps    : {}", summary.steps);
    println!("  Failures : {}", summary.failures);
    println!("  Runtime  : {:.1}s", summary.runtime_seconds);
    if !summary.stuck_reasons.is_empty() {
        println!("  Stuck    : {}", summary.stuck_reasons.join(", ").yellow());
    }
    if let Some(plan) = &summary.plan {
        println!("  Plan     : {}", plan.summary_line().dimmed());
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"   ______  __    __       ___"#.bold().cyan());
    println!("{}", r#"  / ____/ / /   / /      /   |"#.bold().cyan());
    println!("{}", r#" / /     / /   / /     / /| |"#.bold().cyan());
    println!("{}", r#"/ /___  / /__/ /     / ___ |"#.bold().cyan());
    println!("{}", r#"\____/  \____/     /_/  |_|"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "CUA".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Computer-Use Agent");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> std::vec::IntoIter<String> {
        list.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn no_args_means_default_adapter() {
        assert_eq!(parse_args(args(&[])).unwrap(), None);
    }

    #[test]
    fn adapter_flag_is_parsed() {
        assert_eq!(
            parse_args(args(&["--adapter", "sim"])).unwrap(),
            Some("sim".to_string())
        );
    }

    #[test]
    fn adapter_flag_without_value_is_an_error() {
        assert!(parse_args(args(&["--adapter"])).is_err());
    }

    #[test]
    fn unknown_argument_is_an_error() {
        let err = parse_args(args(&["--frobnicate"])).unwrap_err();
        assert!(err.contains("--frobnicate"));
    }
}
