// ============================================================================
// Download Orchestration
// ============================================================================
// One background worker walks the search terms in order:
//   search page -> dedupe -> fetch bytes -> validate -> write -> report
// Progress flows back to the front end over an mpsc channel.
// ============================================================================

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use atomicwrites::{AtomicFile, DisallowOverwrite};

use crate::error::{Error, Result};
use crate::pexels::{PexelsClient, Photo, Quality, SearchFilters, MAX_PER_PAGE};
use crate::rate_limit::Quota;

pub const MAX_IMAGES_PER_TERM: u32 = 1000;

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub api_key: String,
    pub terms: Vec<String>,
    pub images_per_term: u32,
    pub output_dir: PathBuf,
    pub filters: SearchFilters,
    pub quality: Quality,
}

impl DownloadJob {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::invalid_input("API key cannot be empty"));
        }
        if self.terms.iter().all(|t| t.trim().is_empty()) {
            return Err(Error::invalid_input("at least one search term is required"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::invalid_input("output folder cannot be empty"));
        }
        if !(1..=MAX_IMAGES_PER_TERM).contains(&self.images_per_term) {
            return Err(Error::invalid_input(format!(
                "images per term must be between 1 and {}",
                MAX_IMAGES_PER_TERM
            )));
        }
        Ok(())
    }
}

/// Split comma-separated input into distinct, trimmed search terms.
pub fn parse_terms(input: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    input
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_lowercase()))
        .map(str::to_string)
        .collect()
}

/// Folder name for a search term, safe on Windows, macOS and Linux.
pub fn sanitize_folder_name(term: &str) -> String {
    let cleaned: String = term
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_end_matches(['.', ' ']);
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        cleaned.to_string()
    }
}

// ============================================================================
// Image validation
// ============================================================================

/// Identify the image format from its leading bytes.
pub fn detect_image_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else {
        None
    }
}

// ============================================================================
// Progress reporting
// ============================================================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyExists,
    DuplicateInRun,
    InvalidImage,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    TermStarted { term: String, folder: PathBuf },
    PageFetched { term: String, page: u32, photos: usize, total_results: u32 },
    Downloaded { term: String, done: u32, target: u32, path: PathBuf, bytes: usize },
    Skipped { term: String, photo_id: u64, reason: SkipReason },
    Failed { term: String, photo_id: u64, error: String },
    TermFinished(TermReport),
    Finished(Summary),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermReport {
    pub term: String,
    pub downloaded: u32,
    pub skipped: u32,
    pub failed: u32,
    /// The API ran out of results before the target was reached
    pub exhausted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Summary {
    pub terms: Vec<TermReport>,
    pub quota: Quota,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl Summary {
    pub fn total_downloaded(&self) -> u32 {
        self.terms.iter().map(|t| t.downloaded).sum()
    }
}

// ============================================================================
// Worker handle
// ============================================================================
pub struct DownloadHandle {
    pub events: Receiver<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<Summary>,
}

impl DownloadHandle {
    /// Flag the worker polls between photos; setting it stops the run.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn join(self) -> Result<Summary> {
        self.handle.join().map_err(|_| Error::WorkerPanicked)
    }
}

/// Validate the job and start the background worker.
pub fn spawn(job: DownloadJob, client: PexelsClient) -> Result<DownloadHandle> {
    job.validate()?;
    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));
    let worker = Downloader::new(job, client, tx, Arc::clone(&cancel));
    let handle = thread::Builder::new()
        .name("pexels-download".to_string())
        .spawn(move || worker.run())?;
    Ok(DownloadHandle {
        events: rx,
        cancel,
        handle,
    })
}

enum Outcome {
    Downloaded { path: PathBuf, bytes: usize },
    Skipped(SkipReason),
    Failed(Error),
}

pub struct Downloader {
    job: DownloadJob,
    client: PexelsClient,
    events: Sender<ProgressEvent>,
    cancel: Arc<AtomicBool>,
    fatal: Option<String>,
}

impl Downloader {
    pub fn new(job: DownloadJob, client: PexelsClient, events: Sender<ProgressEvent>, cancel: Arc<AtomicBool>) -> Self {
        Downloader {
            job,
            client,
            events,
            cancel,
            fatal: None,
        }
    }

    fn emit(&self, event: ProgressEvent) {
        // The front end may have gone away; the download still completes.
        self.events.send(event).ok();
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn run(mut self) -> Summary {
        let started = Instant::now();
        let terms: Vec<String> = self
            .job
            .terms
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        let mut reports = Vec::with_capacity(terms.len());

        for term in &terms {
            if self.cancelled() || self.fatal.is_some() {
                break;
            }
            let report = self.run_term(term);
            self.emit(ProgressEvent::TermFinished(report.clone()));
            reports.push(report);
        }

        let summary = Summary {
            terms: reports,
            quota: self.client.quota().clone(),
            cancelled: self.cancelled(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            downloaded = summary.total_downloaded(),
            cancelled = summary.cancelled,
            elapsed = ?summary.elapsed,
            "download run finished"
        );
        self.emit(ProgressEvent::Finished(summary.clone()));
        summary
    }

    fn run_term(&mut self, term: &str) -> TermReport {
        let span = tracing::info_span!("term", term);
        let _enter = span.enter();

        let mut report = TermReport {
            term: term.to_string(),
            ..Default::default()
        };

        let folder = self.job.output_dir.join(sanitize_folder_name(term));
        if let Err(e) = fs::create_dir_all(&folder) {
            tracing::error!(folder = %folder.display(), error = %e, "failed creating term folder");
            report.error = Some(format!("cannot create {}: {}", folder.display(), e));
            return report;
        }
        self.emit(ProgressEvent::TermStarted {
            term: term.to_string(),
            folder: folder.clone(),
        });

        let target = self.job.images_per_term;
        let per_page = target.min(MAX_PER_PAGE);
        let mut seen: HashSet<u64> = HashSet::new();
        let mut next_url: Option<String> = None;
        let mut page = 1u32;

        loop {
            if self.cancelled() {
                break;
            }

            let result = match next_url.take() {
                None => self.client.search(term, &self.job.filters, page, per_page),
                Some(url) => self.client.fetch_page(&url),
            };
            let response = match result {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, page, "API error");
                    report.error = Some(e.to_string());
                    if e.is_fatal() {
                        self.fatal = Some(e.to_string());
                    }
                    break;
                }
            };

            tracing::info!(page, photos = response.photos.len(), total = response.total_results, "fetched page");
            self.emit(ProgressEvent::PageFetched {
                term: term.to_string(),
                page,
                photos: response.photos.len(),
                total_results: response.total_results,
            });

            if response.photos.is_empty() {
                report.exhausted = true;
                break;
            }

            for photo in &response.photos {
                if report.downloaded >= target || self.cancelled() {
                    break;
                }
                let outcome = if seen.insert(photo.id) {
                    self.process_photo(photo, &folder)
                } else {
                    Outcome::Skipped(SkipReason::DuplicateInRun)
                };
                match outcome {
                    Outcome::Downloaded { path, bytes } => {
                        report.downloaded += 1;
                        self.emit(ProgressEvent::Downloaded {
                            term: term.to_string(),
                            done: report.downloaded,
                            target,
                            path,
                            bytes,
                        });
                    }
                    Outcome::Skipped(reason) => {
                        report.skipped += 1;
                        self.emit(ProgressEvent::Skipped {
                            term: term.to_string(),
                            photo_id: photo.id,
                            reason,
                        });
                    }
                    Outcome::Failed(e) => {
                        report.failed += 1;
                        self.emit(ProgressEvent::Failed {
                            term: term.to_string(),
                            photo_id: photo.id,
                            error: e.to_string(),
                        });
                    }
                }
            }

            if report.downloaded >= target {
                break;
            }
            match response.next_page {
                Some(url) if !url.is_empty() => {
                    next_url = Some(url);
                    page += 1;
                }
                _ => {
                    report.exhausted = true;
                    break;
                }
            }
        }

        tracing::info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed,
            "term finished"
        );
        report
    }

    fn process_photo(&self, photo: &Photo, folder: &Path) -> Outcome {
        let url = photo.download_url(self.job.quality);
        let path = folder.join(photo.file_name(url));

        if path.exists() {
            tracing::debug!(id = photo.id, "already on disk");
            return Outcome::Skipped(SkipReason::AlreadyExists);
        }

        tracing::debug!(id = photo.id, photographer = %photo.photographer, url, "downloading");
        let bytes = match self.client.fetch_bytes(url) {
            Ok(b) => b,
            Err(Error::InvalidImage(why)) => {
                tracing::warn!(id = photo.id, why = %why, "skipping invalid image");
                return Outcome::Skipped(SkipReason::InvalidImage);
            }
            Err(e) => {
                tracing::error!(id = photo.id, error = %e, "image download failed");
                return Outcome::Failed(e);
            }
        };

        if detect_image_format(&bytes).is_none() {
            tracing::warn!(id = photo.id, len = bytes.len(), "skipping invalid image");
            return Outcome::Skipped(SkipReason::InvalidImage);
        }

        match write_image(&path, &bytes) {
            Ok(()) => Outcome::Downloaded {
                path,
                bytes: bytes.len(),
            },
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed writing image");
                Outcome::Failed(e)
            }
        }
    }
}

/// The image appears under its final name only once fully written.
fn write_image(path: &Path, bytes: &[u8]) -> Result<()> {
    AtomicFile::new(path, DisallowOverwrite)
        .write(|f| f.write_all(bytes))
        .map_err(std::io::Error::from)?;
    Ok(())
}
