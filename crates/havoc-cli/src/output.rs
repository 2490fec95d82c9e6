use havoc_fuzz::SessionSummary;
use havoc_runner::ExperimentReport;

/// Render an experiment report as human-readable text.
pub fn render_report(report: &ExperimentReport) -> String {
    let mut out = String::new();

    out.push_str(&format!(
        "Experiment {} ({})\n",
        report.scenario_name, report.test_id
    ));
    if report.dry_run {
        out.push_str("  dry run: scenario valid, nothing executed\n");
        return out;
    }

    out.push_str(&format!(
        "  result:  {}{}\n",
        if report.passed { "PASSED" } else { "FAILED" },
        if report.interrupted { " (interrupted)" } else { "" }
    ));

    out.push_str("  phases:\n");
    for timing in &report.phase_timings {
        let elapsed = match timing.finished_at {
            Some(end) => format!(
                "{:.1}s",
                (end - timing.started_at).num_milliseconds() as f64 / 1000.0
            ),
            None => "-".to_string(),
        };
        out.push_str(&format!("    {:<10} {}\n", timing.phase.to_string(), elapsed));
    }

    if !report.targets.is_empty() {
        out.push_str("  targets:\n");
        for t in &report.targets {
            out.push_str(&format!(
                "    {} -> {} ({})\n",
                t.alias,
                t.name,
                t.ip.as_deref().unwrap_or("no ip")
            ));
        }
    }

    if !report.criteria.is_empty() {
        out.push_str("  criteria:\n");
        for c in &report.criteria {
            let marker = if c.passed { "+" } else { "-" };
            let criticality = if c.critical { " [critical]" } else { "" };
            out.push_str(&format!(
                "    {} {}{}: {}\n",
                marker, c.name, criticality, c.message
            ));
        }
    }

    let cleanup_failures = report.cleanup_audit.iter().filter(|e| !e.success).count();
    out.push_str(&format!(
        "  cleanup: {} step(s), {} failure(s)\n",
        report.cleanup_audit.len(),
        cleanup_failures
    ));

    if !report.errors.is_empty() {
        out.push_str("  errors:\n");
        for e in &report.errors {
            out.push_str(&format!("    ! {}\n", e));
        }
    }

    out
}

/// Render a fuzz session summary as human-readable text.
pub fn render_summary(summary: &SessionSummary) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Fuzz session {} (seed {})\n",
        summary.session_id, summary.seed
    ));
    out.push_str(&format!(
        "  rounds:  {}/{} run — {} passed, {} failed, {} dry, {} interrupted\n",
        summary.rounds_run,
        summary.rounds_requested,
        summary.passed,
        summary.failed,
        summary.dry_runs,
        summary.interrupted
    ));
    if let Some(cmd) = &summary.repro_command {
        out.push_str(&format!("  reproduce: {}\n", cmd));
    }
    out
}
