// ============================================================================
// Terminal Progress
// ============================================================================
// Renders worker events as status lines plus a single-line progress bar:
//   ⠋ [----      ] 40% [4/10] mountain lake
// ============================================================================

use std::io::{self, Write};
use std::time::{Duration, Instant};

use colored::*;

use crate::downloader::{ProgressEvent, SkipReason, Summary};

const BAR_WIDTH: usize = 30;
const MAX_LABEL_LEN: usize = 35;
const SPINNER: [char; 10] = ['⠋', '⠙', '⠹', '⠸', '⠼', '⠴', '⠦', '⠧', '⠇', '⠏'];

/// `[-----     ]` style bar, `current` clamped to `total`
pub fn render_bar(current: usize, total: usize, width: usize) -> String {
    if total == 0 {
        return " ".repeat(width);
    }
    let filled = (current.min(total) * width) / total;
    "-".repeat(filled) + &" ".repeat(width - filled)
}

fn percent(current: usize, total: usize) -> u32 {
    if total == 0 {
        0
    } else {
        ((current.min(total) as f64 / total as f64) * 100.0) as u32
    }
}

/// Truncate long labels so the bar never wraps onto a second line
fn truncate_label(label: &str) -> String {
    if label.chars().count() > MAX_LABEL_LEN {
        let head: String = label.chars().take(MAX_LABEL_LEN).collect();
        format!("{}...", head)
    } else {
        label.to_string()
    }
}

fn clear_progress_line() {
    print!("\r{}\r", " ".repeat(100));
    io::stdout().flush().ok();
}

pub struct ProgressPrinter {
    frame: usize,
    last_frame: Instant,
    bar_visible: bool,
    verbose: bool,
}

impl ProgressPrinter {
    pub fn new(verbose: bool) -> Self {
        ProgressPrinter {
            frame: 0,
            last_frame: Instant::now(),
            bar_visible: false,
            verbose,
        }
    }

    fn spinner(&mut self) -> char {
        if self.last_frame.elapsed() >= Duration::from_millis(100) {
            self.frame = (self.frame + 1) % SPINNER.len();
            self.last_frame = Instant::now();
        }
        SPINNER[self.frame]
    }

    /// Print a status line above the progress bar.
    fn line(&mut self, text: String) {
        if self.bar_visible {
            clear_progress_line();
            self.bar_visible = false;
        }
        println!("{}", text);
    }

    fn bar(&mut self, done: u32, target: u32, label: &str) {
        let spinner = self.spinner();
        let (done, target) = (done as usize, target as usize);
        print!(
            "\r{} [{}] {}% [{}/{}] {}",
            spinner.to_string().cyan(),
            render_bar(done, target, BAR_WIDTH),
            percent(done, target).to_string().bright_green(),
            done.to_string().bright_cyan(),
            target.to_string().bright_cyan(),
            truncate_label(label)
        );
        io::stdout().flush().ok();
        self.bar_visible = true;
    }

    pub fn handle(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::TermStarted { term, folder } => {
                self.line(String::new());
                self.line(format!("{} {}", "+".cyan(), format!("Searching '{}'", term).green().bold()));
                self.line(format!("  {}", format!("→ Saving to {}", folder.display()).dimmed()));
            }
            ProgressEvent::PageFetched { page, photos, total_results, .. } => {
                if self.verbose {
                    self.line(format!(
                        "  {}",
                        format!("Page {}: {} photos ({} results total)", page, photos, total_results).cyan()
                    ));
                }
            }
            ProgressEvent::Downloaded { term, done, target, path, bytes } => {
                if self.verbose {
                    let size_mb = *bytes as f64 / (1024.0 * 1024.0);
                    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
                    self.line(format!("{} [{}/{}] {} ({:.2} MB)", "✓".green(), done, target, name, size_mb));
                }
                self.bar(*done, *target, term);
            }
            ProgressEvent::Skipped { photo_id, reason, .. } => match reason {
                SkipReason::InvalidImage => {
                    self.line(format!("{} Skipping invalid image {}", "⊘".cyan(), photo_id));
                }
                SkipReason::AlreadyExists if self.verbose => {
                    self.line(format!("{} Already exists: {}", "⊘".cyan(), photo_id));
                }
                _ => {}
            },
            ProgressEvent::Failed { photo_id, error, .. } => {
                self.line(format!("{} Error downloading image {}: {}", "[ ERROR ]".red(), photo_id, error));
            }
            ProgressEvent::TermFinished(report) => {
                if let Some(error) = &report.error {
                    self.line(format!("{} API Error for '{}': {}", "[ ERROR ]".red(), report.term, error));
                } else if report.exhausted && report.downloaded == 0 && report.skipped == 0 {
                    self.line(format!("{}", format!("! No results for '{}'", report.term).cyan()));
                } else if report.exhausted {
                    self.line(format!(
                        "{}",
                        format!("! Only {} new images available for '{}'", report.downloaded, report.term).cyan()
                    ));
                } else {
                    self.line(format!(
                        "{} {}",
                        "✓".green(),
                        format!("Downloaded {} images for '{}'", report.downloaded, report.term).green()
                    ));
                }
            }
            ProgressEvent::Finished(summary) => {
                if self.bar_visible {
                    clear_progress_line();
                    self.bar_visible = false;
                }
                print_summary(summary);
            }
        }
    }
}

pub fn print_summary(summary: &Summary) {
    println!();
    println!("{}", "+------------------------------------------+".cyan());
    println!("{}", "|             Download Summary             |".cyan().bold());
    println!("{}", "+------------------------------------------+".cyan());
    for report in &summary.terms {
        let status = if report.error.is_some() {
            "error".red()
        } else if report.exhausted {
            "exhausted".yellow()
        } else {
            "done".green()
        };
        println!(
            "  {:<24} {:>4} new  {:>4} skipped  {:>4} failed  {}",
            truncate_label(&report.term),
            report.downloaded,
            report.skipped,
            report.failed,
            status
        );
    }
    println!();
    if summary.cancelled {
        println!("{}", "! Download cancelled".cyan());
    }
    println!(
        "{}",
        format!(
            "Downloaded {} new images in {:.1}s",
            summary.total_downloaded(),
            summary.elapsed.as_secs_f64()
        )
        .green()
        .bold()
    );
    println!("{}", summary.quota.display().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_bar() {
        assert_eq!(render_bar(0, 10, 10), "          ");
        assert_eq!(render_bar(4, 10, 10), "----      ");
        assert_eq!(render_bar(10, 10, 10), "----------");
        // overshoot is clamped
        assert_eq!(render_bar(15, 10, 10), "----------");
        assert_eq!(render_bar(3, 0, 4), "    ");
    }

    #[test]
    fn test_percent_and_label() {
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(5, 0), 0);
        assert_eq!(truncate_label("short"), "short");
        let long = "a".repeat(50);
        assert_eq!(truncate_label(&long), format!("{}...", "a".repeat(MAX_LABEL_LEN)));
    }
}
