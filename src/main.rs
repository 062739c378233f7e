use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::*;
use signal_hook::consts::SIGINT;
use tracing_subscriber::EnvFilter;

mod downloader;
mod error;
mod pexels;
mod progress;
mod rate_limit;
mod retry;
mod settings;

use downloader::{parse_terms, DownloadJob, MAX_IMAGES_PER_TERM};
use pexels::{Color, Locale, Orientation, PexelsClient, Quality, SearchFilters, Size};
use progress::ProgressPrinter;
use rate_limit::{TokenBucket, DEFAULT_RESERVE};
use retry::RetryPolicy;
use settings::Settings;

// ============================================================================
// Command Line
// ============================================================================
#[derive(Debug, Parser)]
#[command(name = "pexels-downloader", version, about = "Search Pexels and download photos into per-term folders")]
struct Cli {
    /// Settings file (default: <config dir>/pexels-downloader/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Log file (default: next to the settings file)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download images for one or more search terms (default)
    Download(DownloadArgs),
    /// Show or change saved settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Show the last known API rate limit
    Quota,
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    /// Print the saved settings (API key masked)
    Show,
    /// Restore all defaults
    Reset,
    /// Forget the saved API key
    ClearKey,
}

#[derive(Debug, Args, Default)]
struct DownloadArgs {
    /// Pexels API key
    #[arg(long, env = "PEXELS_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Comma-separated search terms
    #[arg(short, long)]
    terms: Option<String>,

    /// Images per term
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u32).range(1..=MAX_IMAGES_PER_TERM as i64))]
    count: Option<u32>,

    /// Output folder; one subfolder is created per term
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum)]
    orientation: Option<Orientation>,

    /// Minimum size: large (24MP), medium (12MP), small (4MP)
    #[arg(long, value_enum)]
    size: Option<Size>,

    /// Named color or #rrggbb
    #[arg(long)]
    color: Option<Color>,

    /// Search locale, e.g. en-US
    #[arg(long)]
    locale: Option<Locale>,

    /// Which rendition to download
    #[arg(long, value_enum)]
    quality: Option<Quality>,

    /// Attempts per request before giving up
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=10))]
    retries: Option<u32>,

    /// Maximum API requests per second (0.01 to 50)
    #[arg(long, value_parser = parse_rate)]
    rate: Option<f64>,

    /// Do not remember these inputs
    #[arg(long)]
    no_save: bool,

    /// Fail instead of prompting for missing values
    #[arg(long)]
    no_input: bool,

    /// Print a line for every photo
    #[arg(short, long)]
    verbose: bool,
}

const RATE_RANGE: std::ops::RangeInclusive<f64> = 0.01..=50.0;

fn parse_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.trim().parse().map_err(|_| format!("'{}' is not a number", s))?;
    if RATE_RANGE.contains(&rate) {
        Ok(rate)
    } else {
        Err(format!(
            "rate must be between {} and {} requests per second",
            RATE_RANGE.start(),
            RATE_RANGE.end()
        ))
    }
}

// ============================================================================
// Logging
// ============================================================================
fn init_logging(log_file: &Path) -> anyhow::Result<()> {
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("opening log file {}", log_file.display()))?;

    // Logs go to a file so they never tear the progress line
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("pexels_downloader=info,warn"))?,
        )
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

// ============================================================================
// Prompts
// ============================================================================
fn prompt(question: &str) -> anyhow::Result<String> {
    println!("{}", question.cyan());
    print!("{}", "> ".cyan());
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// CLI value, then saved value, then an interactive prompt.
fn resolve<T>(
    cli: Option<T>,
    saved: Option<T>,
    no_input: bool,
    name: &str,
    question: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> anyhow::Result<T> {
    if let Some(v) = cli.or(saved) {
        return Ok(v);
    }
    if no_input {
        bail!("{} is required (pass it as an argument)", name);
    }
    let answer = prompt(question)?;
    match parse(&answer) {
        Some(v) => Ok(v),
        None => bail!("{} cannot be empty", name),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

// ============================================================================
// Application
// ============================================================================
struct App {
    settings_file: PathBuf,
    settings: Settings,
}

impl App {
    fn new(settings_file: PathBuf) -> anyhow::Result<Self> {
        let settings = Settings::load(&settings_file)
            .with_context(|| format!("loading settings from {}", settings_file.display()))?;
        Ok(App {
            settings_file,
            settings,
        })
    }

    fn save_settings(&self) -> anyhow::Result<()> {
        self.settings
            .save(&self.settings_file)
            .with_context(|| format!("saving settings to {}", self.settings_file.display()))
    }

    fn build_job(&self, args: &DownloadArgs) -> anyhow::Result<DownloadJob> {
        let saved = &self.settings;

        let api_key = resolve(
            args.api_key.clone().and_then(|k| non_empty(&k)),
            non_empty(&saved.api_key),
            args.no_input,
            "API key",
            "Enter your Pexels API key (get one at https://www.pexels.com/api/new/):",
            non_empty,
        )?;
        let terms = resolve(
            args.terms.as_deref().map(parse_terms).filter(|t| !t.is_empty()),
            Some(parse_terms(&saved.search_terms)).filter(|t| !t.is_empty()),
            args.no_input,
            "Search terms",
            "Search terms (comma-separated):",
            |s| Some(parse_terms(s)).filter(|t| !t.is_empty()),
        )?;
        let output_dir = resolve(
            args.output.clone(),
            saved.output_folder.clone(),
            args.no_input,
            "Output folder",
            &format!(
                "Output folder (press Enter for {}):",
                settings::default_output_folder().display()
            ),
            |s| Some(non_empty(s).map(PathBuf::from).unwrap_or_else(settings::default_output_folder)),
        )?;

        let saved_filters = saved.filters();
        let filters = SearchFilters {
            orientation: args.orientation.or(saved_filters.orientation),
            size: args.size.or(saved_filters.size),
            color: args.color.clone().or(saved_filters.color),
            locale: args.locale.clone().or(saved_filters.locale),
        };

        let job = DownloadJob {
            api_key,
            terms,
            images_per_term: args.count.unwrap_or(saved.images_per_term),
            output_dir,
            filters,
            quality: args.quality.unwrap_or(saved.quality),
        };
        job.validate()?;
        Ok(job)
    }

    fn remember(&mut self, job: &DownloadJob) {
        let s = &mut self.settings;
        s.api_key = job.api_key.clone();
        s.search_terms = job.terms.join(", ");
        s.images_per_term = job.images_per_term;
        s.output_folder = Some(job.output_dir.clone());
        s.orientation = job.filters.orientation;
        s.size = job.filters.size;
        s.color = job.filters.color.clone();
        s.locale = job.filters.locale.clone();
        s.quality = job.quality;
    }

    // ========================================================================
    // DOWNLOAD Command
    // ========================================================================
    fn download(&mut self, args: &DownloadArgs) -> anyhow::Result<()> {
        println!();
        println!("{}", "+------------------------------------------+".cyan());
        println!("{}", "|         Pexels Image Downloader          |".cyan().bold());
        println!("{}", "+------------------------------------------+".cyan());
        println!();

        let job = self.build_job(args)?;

        // Refuse to start while the last known budget is used up
        self.settings.quota.check(DEFAULT_RESERVE, Utc::now())?;

        if !args.no_save {
            self.remember(&job);
            self.save_settings()?;
        }

        tracing::info!(
            terms = ?job.terms,
            per_term = job.images_per_term,
            output = %job.output_dir.display(),
            "starting download"
        );
        println!(
            "{}",
            format!(
                "→ {} images for {} term(s) into {}",
                job.images_per_term,
                job.terms.len(),
                job.output_dir.display()
            )
            .cyan()
        );

        let mut client = PexelsClient::new(&job.api_key)?.with_quota(self.settings.quota.clone(), DEFAULT_RESERVE);
        if let Some(attempts) = args.retries {
            client = client.with_retry(RetryPolicy {
                max_attempts: attempts,
                ..Default::default()
            });
        }
        if let Some(rate) = args.rate {
            client = client.with_limiter(TokenBucket::new(1, rate));
        }
        let handle = downloader::spawn(job, client)?;

        // First Ctrl-C stops after the current photo, a second one exits at once
        let cancel = handle.cancel_flag();
        signal_hook::flag::register_conditional_shutdown(SIGINT, 130, Arc::clone(&cancel))
            .context("installing Ctrl-C handler")?;
        signal_hook::flag::register(SIGINT, cancel).context("installing Ctrl-C handler")?;
        println!("{}", "  (press Ctrl-C to stop after the current image)".dimmed());

        let mut printer = ProgressPrinter::new(args.verbose);
        for event in handle.events.iter() {
            printer.handle(&event);
        }
        let summary = handle.join()?;

        self.settings.quota = summary.quota.clone();
        self.settings.last_run = Some(Utc::now().to_rfc3339());
        self.save_settings()?;

        if let Some(fatal) = summary.terms.iter().rev().find_map(|t| t.error.as_deref()) {
            if summary.terms.iter().all(|t| t.downloaded == 0) {
                bail!("{}", fatal);
            }
        }
        Ok(())
    }

    // ========================================================================
    // SETTINGS Commands
    // ========================================================================
    fn show_settings(&self) {
        let s = &self.settings;
        let unset = || "(not set)".to_string();
        println!();
        println!("{}", "+ Saved Settings".green().bold());
        println!("  {:<16} {}", "File:", self.settings_file.display());
        println!("  {:<16} {}", "API key:", s.masked_api_key());
        println!(
            "  {:<16} {}",
            "Search terms:",
            if s.search_terms.is_empty() { unset() } else { s.search_terms.clone() }
        );
        println!("  {:<16} {}", "Images/term:", s.images_per_term);
        println!(
            "  {:<16} {}",
            "Output folder:",
            s.output_folder.as_ref().map(|p| p.display().to_string()).unwrap_or_else(unset)
        );
        println!(
            "  {:<16} {}",
            "Orientation:",
            s.orientation.map(|o| o.as_str().to_string()).unwrap_or_else(unset)
        );
        println!("  {:<16} {}", "Size:", s.size.map(|o| o.as_str().to_string()).unwrap_or_else(unset));
        println!("  {:<16} {}", "Color:", s.color.as_ref().map(|c| c.to_string()).unwrap_or_else(unset));
        println!("  {:<16} {}", "Locale:", s.locale.as_ref().map(|l| l.to_string()).unwrap_or_else(unset));
        println!("  {:<16} {:?}", "Quality:", s.quality);
        println!("  {:<16} {}", "Last run:", s.last_run.clone().unwrap_or_else(|| "never".to_string()));
        println!();
    }

    fn reset_settings(&mut self) -> anyhow::Result<()> {
        self.settings = Settings::default();
        self.save_settings()?;
        println!("{}", "✓ Settings reset to defaults".green().bold());
        Ok(())
    }

    fn clear_api_key(&mut self) -> anyhow::Result<()> {
        if self.settings.api_key.is_empty() {
            println!("{}", "! API key is already empty".cyan());
            return Ok(());
        }
        self.settings.api_key.clear();
        self.save_settings()?;
        println!("{}", "✓ Pexels API key has been cleared".green().bold());
        Ok(())
    }

    fn show_quota(&self) {
        println!("{}", self.settings.quota.display().cyan());
        if let Some(reset) = self.settings.quota.effective(Utc::now()).reset_at {
            println!("{}", format!("  Window resets at {}", reset.with_timezone(&chrono::Local).format("%H:%M")).dimmed());
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================
fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings_file = match cli.settings {
        Some(path) => path,
        None => settings::default_path()?,
    };
    let log_file = match cli.log_file {
        Some(path) => path,
        None => settings_file
            .parent()
            .map(|p| p.join(settings::LOG_FILE))
            .unwrap_or_else(|| PathBuf::from(settings::LOG_FILE)),
    };
    init_logging(&log_file)?;

    let mut app = App::new(settings_file)?;
    // Bare invocation behaves like `download` with saved settings
    let command = cli.command.unwrap_or_else(|| {
        Command::Download(DownloadArgs {
            api_key: std::env::var("PEXELS_API_KEY").ok(),
            ..Default::default()
        })
    });
    match command {
        Command::Download(args) => app.download(&args)?,
        Command::Settings { action } => match action {
            SettingsAction::Show => app.show_settings(),
            SettingsAction::Reset => app.reset_settings()?,
            SettingsAction::ClearKey => app.clear_api_key()?,
        },
        Command::Quota => app.show_quota(),
    }
    Ok(())
}

fn main() {
    if let Err(e) = try_main() {
        tracing::error!(error = %e, "fatal");
        eprintln!("{}", format!("[ ERROR ] {:#}", e).red());
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_with(settings: Settings) -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        settings.save(&path).unwrap();
        let app = App::new(path).unwrap();
        (dir, app)
    }

    #[test]
    fn test_cli_parses_download_flags() {
        let cli = Cli::try_parse_from([
            "pexels-downloader",
            "download",
            "--api-key",
            "k",
            "-t",
            "cats, dogs",
            "-n",
            "25",
            "--orientation",
            "portrait",
            "--color",
            "#112233",
            "--locale",
            "fr-FR",
            "--quality",
            "large2x",
        ])
        .unwrap();
        let Some(Command::Download(args)) = cli.command else {
            panic!("expected download command");
        };
        assert_eq!(args.count, Some(25));
        assert_eq!(args.orientation, Some(Orientation::Portrait));
        assert_eq!(args.color.unwrap().to_string(), "#112233");
        assert_eq!(args.quality, Some(Quality::Large2x));

        assert!(Cli::try_parse_from(["pexels-downloader", "download", "-n", "0"]).is_err());
        assert!(Cli::try_parse_from(["pexels-downloader", "download", "--color", "purple"]).is_err());
    }

    #[test]
    fn test_rate_is_bounded() {
        let cli = Cli::try_parse_from(["pexels-downloader", "download", "--rate", "0.5"]).unwrap();
        let Some(Command::Download(args)) = cli.command else {
            panic!("expected download command");
        };
        assert_eq!(args.rate, Some(0.5));

        for bad in ["1e-20", "0", "-1", "500", "NaN", "fast"] {
            assert!(
                Cli::try_parse_from(["pexels-downloader", "download", "--rate", bad]).is_err(),
                "accepted --rate {}",
                bad
            );
        }
    }

    #[test]
    fn test_download_refuses_to_start_on_exhausted_quota() {
        let reset_at = Utc::now() + chrono::Duration::minutes(30);
        let (dir, mut app) = app_with(Settings {
            quota: rate_limit::Quota {
                limit: 200,
                remaining: 3,
                reset_at: Some(reset_at),
            },
            ..Default::default()
        });
        let args = DownloadArgs {
            api_key: Some("k".into()),
            terms: Some("cats".into()),
            output: Some(dir.path().join("out")),
            no_input: true,
            ..Default::default()
        };

        let err = app.download(&args).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<error::Error>(),
            Some(error::Error::QuotaExhausted { .. })
        ));
        // nothing was started or remembered
        assert!(!dir.path().join("out").exists());
        assert!(Settings::load(&app.settings_file).unwrap().search_terms.is_empty());
    }

    #[test]
    fn test_build_job_falls_back_to_saved_filters() {
        let (dir, app) = app_with(Settings {
            api_key: "k".into(),
            search_terms: "ocean".into(),
            orientation: Some(Orientation::Landscape),
            color: Some("red".parse().unwrap()),
            ..Default::default()
        });
        let args = DownloadArgs {
            output: Some(dir.path().to_path_buf()),
            color: Some("blue".parse().unwrap()),
            no_input: true,
            ..Default::default()
        };
        let job = app.build_job(&args).unwrap();
        assert_eq!(job.filters.orientation, Some(Orientation::Landscape));
        assert_eq!(job.filters.color.unwrap().to_string(), "blue");
    }

    #[test]
    fn test_build_job_prefers_cli_over_saved() {
        let (dir, app) = app_with(Settings {
            api_key: "saved-key".into(),
            search_terms: "ocean".into(),
            images_per_term: 10,
            output_folder: Some(PathBuf::from("saved-out")),
            size: Some(Size::Small),
            ..Default::default()
        });
        let args = DownloadArgs {
            terms: Some("cats,dogs".into()),
            output: Some(dir.path().to_path_buf()),
            no_input: true,
            ..Default::default()
        };

        let job = app.build_job(&args).unwrap();
        assert_eq!(job.api_key, "saved-key");
        assert_eq!(job.terms, vec!["cats", "dogs"]);
        assert_eq!(job.images_per_term, 10);
        assert_eq!(job.output_dir, dir.path());
        assert_eq!(job.filters.size, Some(Size::Small));
    }

    #[test]
    fn test_build_job_without_input_fails_on_missing_values() {
        let (_dir, app) = app_with(Settings::default());
        let args = DownloadArgs {
            terms: Some("cats".into()),
            no_input: true,
            ..Default::default()
        };
        let err = app.build_job(&args).unwrap_err();
        assert!(err.to_string().contains("API key is required"));
    }

    #[test]
    fn test_remember_then_clear_key() {
        let (_dir, mut app) = app_with(Settings::default());
        let job = DownloadJob {
            api_key: "k".into(),
            terms: vec!["a".into(), "b".into()],
            images_per_term: 7,
            output_dir: PathBuf::from("out"),
            filters: SearchFilters::default(),
            quality: Quality::Medium,
        };
        app.remember(&job);
        app.save_settings().unwrap();

        let reloaded = Settings::load(&app.settings_file).unwrap();
        assert_eq!(reloaded.search_terms, "a, b");
        assert_eq!(reloaded.quality, Quality::Medium);

        app.clear_api_key().unwrap();
        assert!(Settings::load(&app.settings_file).unwrap().api_key.is_empty());
    }
}
