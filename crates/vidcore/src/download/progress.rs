//! Backend progress output → structured events → task fields.
//!
//! The line grammar is whatever yt-dlp prints with `--newline`; it carries no
//! stability guarantee, so parsing is best effort and versioned by
//! [`GRAMMAR_VERSION`]. A line that matches nothing is ignored, never an error.
//!
//! Recognized shapes:
//!
//! ```text
//! [download] Destination: /work/t1/t1.f137.mp4
//! [download] /work/t1/t1.f137.mp4 has already been downloaded
//! [download]  42.5% of ~  10.50MiB at    1.20MiB/s ETA 00:07 (frag 3/12)
//! [download] 100% of   10.50MiB in 00:00:09 at 1.16MiB/s
//! [Merger] Merging formats into "/work/t1/t1.mp4"
//! ERROR: [youtube] abc: Video unavailable
//! ```

use lazy_regex::{regex_captures, regex_is_match};

use crate::download::task::{TaskPhase, TaskSnapshot, TaskStatus};

pub const GRAMMAR_VERSION: &str = "yt-dlp-newline/1";

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A new stream started writing
    StreamStarted,
    /// The stream was already on disk; counts as a finished stream
    AlreadyDownloaded,
    Progress(StreamProgress),
    /// Streams are being combined; no measurable progress until exit
    Merging,
    /// Backend reported an error; kept for logs only
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamProgress {
    /// Percent of the current stream, 0..=100
    pub percent: f64,
    pub total_bytes: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// Parse one line of backend output.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("ERROR:") {
        return Some(ProgressEvent::Error(rest.trim().to_string()));
    }

    if regex_is_match!(r"^\[Merger\]", line) {
        return Some(ProgressEvent::Merging);
    }

    if !line.starts_with("[download]") {
        return None;
    }

    if regex_is_match!(r"^\[download\]\s+Destination:", line) {
        return Some(ProgressEvent::StreamStarted);
    }

    if regex_is_match!(r"has already been downloaded", line) {
        return Some(ProgressEvent::AlreadyDownloaded);
    }

    let (_, pct) = regex_captures!(r"^\[download\]\s+([\d.]+)%", line)?;
    let percent = pct.parse::<f64>().ok()?.clamp(0.0, 100.0);

    let total_bytes = regex_captures!(r"of\s+~?\s*([\d.]+)\s*([A-Za-z]+)", line)
        .and_then(|(_, num, unit)| parse_size(num, unit));

    let speed = regex_captures!(r"at\s+([\d.]+\s*[A-Za-z]+/s)", line).map(|(_, s)| s.replace(' ', ""));

    let eta = regex_captures!(r"ETA\s+(\S+)", line)
        .map(|(_, e)| e)
        .filter(|e| !e.eq_ignore_ascii_case("unknown"))
        .map(str::to_string);

    Some(ProgressEvent::Progress(StreamProgress {
        percent,
        total_bytes,
        speed,
        eta,
    }))
}

/// Convert "10.50" + "MiB" into bytes.
pub fn parse_size(number: &str, unit: &str) -> Option<u64> {
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" | "k" | "K" => 1000.0,
        "MB" | "M" => 1_000_000.0,
        "GB" | "G" => 1_000_000_000.0,
        _ => return None,
    };
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier) as u64)
}

/// Folds parsed events into a [`TaskSnapshot`].
///
/// Two-stream downloads (selector with `+`) fetch video first, then audio. The
/// first stream covers `[0, w]` of the overall percentage and the second `[w, 100]`,
/// where `w` is the configured first-stream weight. Overall progress never moves
/// backwards while downloading.
#[derive(Debug)]
pub struct ProgressTracker {
    two_stream: bool,
    first_weight: f64,
    /// 0 before any stream output, then 1 or 2
    stream: u8,
    merging: bool,
    finished_stream_bytes: u64,
    current_total: u64,
    last_error: Option<String>,
}

impl ProgressTracker {
    pub fn new(two_stream: bool, first_stream_weight: f64) -> Self {
        Self {
            two_stream,
            first_weight: first_stream_weight.clamp(0.0, 1.0),
            stream: 0,
            merging: false,
            finished_stream_bytes: 0,
            current_total: 0,
            last_error: None,
        }
    }

    pub fn saw_merging(&self) -> bool {
        self.merging
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Apply one event. Returns true when `snapshot` changed.
    pub fn apply(&mut self, event: &ProgressEvent, snapshot: &mut TaskSnapshot) -> bool {
        if snapshot.is_terminal() {
            return false;
        }

        match event {
            ProgressEvent::Error(message) => {
                self.last_error = Some(message.clone());
                false
            }
            ProgressEvent::Merging => self.enter_merging(snapshot),
            _ if self.merging => false,
            ProgressEvent::StreamStarted => {
                self.next_stream();
                self.mark_downloading(snapshot);
                true
            }
            ProgressEvent::AlreadyDownloaded => {
                self.next_stream();
                self.mark_downloading(snapshot);
                self.apply_percent(100.0, snapshot);
                true
            }
            ProgressEvent::Progress(progress) => {
                if self.stream == 0 {
                    self.next_stream();
                }
                self.mark_downloading(snapshot);
                if let Some(total) = progress.total_bytes {
                    self.current_total = total;
                }
                self.apply_percent(progress.percent, snapshot);
                snapshot.speed = progress.speed.clone();
                snapshot.eta = progress.eta.clone();
                true
            }
        }
    }

    /// Transition into `merging`. Used both for the backend's merge marker and by
    /// the supervisor when a two-stream download exits without printing one.
    pub fn enter_merging(&mut self, snapshot: &mut TaskSnapshot) -> bool {
        if self.merging || snapshot.is_terminal() {
            return false;
        }
        self.merging = true;
        snapshot.status = TaskStatus::Merging;
        snapshot.phase = TaskPhase::Merging;
        snapshot.progress_percent = None;
        snapshot.speed = None;
        snapshot.eta = None;
        true
    }

    fn next_stream(&mut self) {
        if self.stream == 0 {
            self.stream = 1;
        } else if self.two_stream && self.stream == 1 {
            self.finished_stream_bytes = self.finished_stream_bytes.saturating_add(self.current_total);
            self.current_total = 0;
            self.stream = 2;
        }
    }

    fn mark_downloading(&self, snapshot: &mut TaskSnapshot) {
        snapshot.status = TaskStatus::Downloading;
        snapshot.phase = match (self.two_stream, self.stream) {
            (false, _) => TaskPhase::None,
            (true, 2) => TaskPhase::Audio,
            (true, _) => TaskPhase::Video,
        };
    }

    fn apply_percent(&self, stream_percent: f64, snapshot: &mut TaskSnapshot) {
        let p = stream_percent.clamp(0.0, 100.0);
        let overall = if !self.two_stream {
            p
        } else if self.stream == 2 {
            100.0 * self.first_weight + (1.0 - self.first_weight) * p
        } else {
            self.first_weight * p
        };

        let previous = snapshot.progress_percent.unwrap_or(0.0);
        snapshot.progress_percent = Some(overall.max(previous));

        let current_done = (self.current_total as f64 * p / 100.0) as u64;
        snapshot.downloaded_bytes = self.finished_stream_bytes.saturating_add(current_done);
        snapshot.total_bytes = self.finished_stream_bytes.saturating_add(self.current_total);
    }
}
