//! Progress display module
//!
//! Renders a single refreshing progress line on stdout.

use std::io::{self, Write};
use std::time::{Duration, Instant};

/// Download statistics for progress display
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadStats {
    /// Bytes in verified pieces
    pub downloaded: u64,
    /// Total content length
    pub total: u64,
    /// Verified pieces
    pub pieces_complete: usize,
    /// Pieces in the torrent
    pub pieces_total: usize,
    /// Download speed in bytes per second
    pub download_speed: f64,
    /// Number of running peer connections
    pub peers: usize,
}

impl DownloadStats {
    /// Fraction complete, 0.0 to 1.0
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.downloaded as f64 / self.total as f64
    }

    /// `1536` -> `1.5 KiB`
    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
        if bytes < 1024 {
            return format!("{} B", bytes);
        }
        let mut value = bytes as f64 / 1024.0;
        let mut unit = 0;
        while value >= 1024.0 && unit + 1 < UNITS.len() {
            value /= 1024.0;
            unit += 1;
        }
        format!("{:.1} {}", value, UNITS[unit])
    }

    pub fn format_speed(bytes_per_sec: f64) -> String {
        Self::format_bytes(bytes_per_sec.max(0.0) as u64) + "/s"
    }

    /// `mm:ss`, or `h:mm:ss` past an hour
    pub fn format_duration(duration: Duration) -> String {
        let secs = duration.as_secs();
        match secs / 3600 {
            0 => format!("{:02}:{:02}", secs / 60, secs % 60),
            hours => format!("{}:{:02}:{:02}", hours, secs / 60 % 60, secs % 60),
        }
    }

    /// Remaining time at the current speed, if it is meaningful
    pub fn eta(&self) -> Option<Duration> {
        if self.download_speed <= 0.0 || self.downloaded >= self.total {
            return None;
        }
        let remaining = self.total.saturating_sub(self.downloaded) as f64;
        Some(Duration::from_secs_f64(remaining / self.download_speed))
    }
}

/// Terminal progress line, silent in quiet mode
pub struct ProgressDisplay {
    started: Instant,
    last_draw: Option<Instant>,
    min_redraw: Duration,
    quiet: bool,
    /// Bytes and time at the previous sample, for the speed estimate
    last_sample: Option<(u64, Instant)>,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self::with_interval(quiet, Duration::from_millis(500))
    }

    pub fn with_interval(quiet: bool, min_redraw: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_draw: None,
            min_redraw,
            quiet,
            last_sample: None,
        }
    }

    /// Estimate speed from the bytes completed since the previous sample
    pub fn sample_speed(&mut self, downloaded: u64) -> f64 {
        let now = Instant::now();
        let speed = match self.last_sample {
            Some((bytes, at)) => {
                let elapsed = now.duration_since(at).as_secs_f64();
                if elapsed > 0.0 {
                    downloaded.saturating_sub(bytes) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_sample = Some((downloaded, now));
        speed
    }

    /// Redraw the progress line if the update interval has passed
    pub fn update(&mut self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        if self.last_draw.is_some_and(|at| at.elapsed() < self.min_redraw) {
            return Ok(());
        }
        self.last_draw = Some(Instant::now());

        print!("\r\x1b[2K{}", Self::render(stats));
        io::stdout().flush()
    }

    /// The progress line without terminal control codes
    pub fn render(stats: &DownloadStats) -> String {
        let percent = stats.progress() * 100.0;
        let bar_width: usize = 30;
        let filled = ((stats.progress() * bar_width as f64) as usize).min(bar_width);
        let bar = "=".repeat(filled) + &" ".repeat(bar_width - filled);

        let eta = stats
            .eta()
            .map(DownloadStats::format_duration)
            .unwrap_or_else(|| "-".to_string());

        format!(
            "[{}] {:.1}% | {}/{} pieces | {} / {} | {} | Peers: {} | ETA: {}",
            bar,
            percent,
            stats.pieces_complete,
            stats.pieces_total,
            DownloadStats::format_bytes(stats.downloaded),
            DownloadStats::format_bytes(stats.total),
            DownloadStats::format_speed(stats.download_speed),
            stats.peers,
            eta,
        )
    }

    pub fn print_complete(&self, stats: &DownloadStats) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }

        let mut out = io::stdout().lock();
        writeln!(out, "\r\x1b[2K{}", Self::render(stats))?;
        writeln!(
            out,
            "Finished: {} pieces, {} in {}",
            stats.pieces_complete,
            DownloadStats::format_bytes(stats.downloaded),
            DownloadStats::format_duration(self.started.elapsed())
        )?;
        out.flush()
    }

    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        writeln!(io::stdout(), "\r\x1b[2K{}", message)
    }

    /// Printed even in quiet mode
    pub fn print_error(&self, message: &str) -> io::Result<()> {
        writeln!(io::stderr(), "\r\x1b[2Kerror: {}", message)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
