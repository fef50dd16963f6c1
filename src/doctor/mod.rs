//! Doctor: reports whether the configured LLM/STT/TTS adapters are
//! reachable before serving traffic. A handful of independent checks
//! run and print as a report, narrowed to the adapter-reachability
//! contract this server actually needs.

pub mod checks;

use anyhow::Result;

pub async fn run_diagnostics() -> Result<()> {
    println!("voicebridge-server doctor");
    println!("=========================");

    let report = checks::run_all_checks().await;
    let mut any_failed = false;

    for check in &report.checks {
        let marker = if check.ok { "ok  " } else { "FAIL" };
        println!("[{marker}] {:<20} {}", check.name, check.detail);
        if !check.ok {
            any_failed = true;
        }
    }

    if any_failed {
        anyhow::bail!("one or more checks failed");
    }
    println!("\nall checks passed");
    Ok(())
}
