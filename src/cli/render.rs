// ABOUTME: Terminal rendering of a run's event stream with an indicatif progress bar
// ABOUTME: Log lines are printed above the bar; tool output only with --verbose

use indicatif::{ProgressBar, ProgressStyle};
use pgclone::models::{CloneProgress, LogLevel};
use pgclone::progress::{EventStream, RunEvent};

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}";

fn bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template(TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar
}

/// Drain the stream until the run closes it. Returns the last progress seen.
pub async fn follow(mut events: EventStream, verbose: bool) -> Option<CloneProgress> {
    let bar = bar();
    let mut last = None;

    while let Some(event) = events.recv().await {
        match event {
            RunEvent::Progress(progress) => {
                bar.set_position(u64::from(progress.progress));
                bar.set_message(format!("{}: {}", progress.stage, progress.message));
                last = Some(progress);
            }
            RunEvent::Log(line) => {
                if verbose || line.level != LogLevel::Info {
                    bar.println(line.to_string());
                }
            }
        }
    }

    match &last {
        Some(progress) if progress.is_complete && !progress.is_error => {
            bar.finish_with_message(progress.message.clone());
        }
        Some(progress) => bar.abandon_with_message(progress.message.clone()),
        None => bar.abandon(),
    }
    last
}
