//! Output formatting for CLI

use argus_core::{BuildOutcome, BuildSummary};

/// Print success message
pub fn print_success(message: &str) {
    println!("✅ {}", message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Render the terminal report for a finished build.
pub fn print_summary(summary: &BuildSummary) {
    println!();

    match summary.outcome() {
        BuildOutcome::Success => {
            print_success(&format!("{} snapshots uploaded", summary.uploaded.len()));
        }
        BuildOutcome::Partial => {
            print_warning(&format!(
                "{} uploaded, {} failed, {} skipped",
                summary.uploaded.len(),
                summary.failed.len(),
                summary.skipped.len()
            ));
        }
        BuildOutcome::AllFailed => {
            print_error("No snapshot uploaded");
        }
        BuildOutcome::Empty => {
            print_warning("Build finished without snapshots");
        }
    }

    for failed in &summary.failed {
        print_error(&format!("{}: {}", failed.name, failed.reason));
    }
    for name in &summary.skipped {
        print_warning(&format!("{}: skipped", name));
    }
    if summary.warning_count > 0 {
        println!("   {} discovery warnings logged", summary.warning_count);
    }

    if let Some(url) = summary.build.as_ref().and_then(|b| b.web_url.as_deref()) {
        println!();
        println!("Build results: {}", url);
    }
}
