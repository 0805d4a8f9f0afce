//! Collector: the central endpoint that receives relay reports.
//!
//! Keeps the latest report from every relay and prints each one as it arrives,
//! as text or JSON. With an output directory set, every report is also written
//! to disk:
//!
//! ```text
//! <dir>/delays/<relay>   latest entries, overwritten on each report
//! <dir>/logs/<relay>     one timestamped line appended per report
//! ```

use std::{
    collections::HashMap,
    fs::{self, OpenOptions},
    io::Write,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::report::{Report, ReportError};

/// Upper bound on distinct relays kept in memory.
pub const MAX_RELAYS: usize = 1024;

#[derive(Error, Debug, PartialEq)]
pub enum CollectorError {
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("Relay limit of {MAX_RELAYS} reached, dropping report from {0:?}")]
    TooManyRelays(String),
}

/// Output format for received reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for machine consumption.
    Json,
}

/// A report together with where and when it arrived.
#[derive(Debug, Clone)]
pub struct CollectedReport {
    pub source: SocketAddr,
    pub received_at: DateTime<Utc>,
    pub report: Report,
}

impl CollectedReport {
    /// Renders the entry in the given format.
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => self.render_text(),
            OutputFormat::Json => self.render_json(),
        }
    }

    fn render_text(&self) -> String {
        let mut line = format!(
            "{} {} ({})",
            self.received_at.format("%Y-%m-%d %H:%M:%S"),
            self.report.name,
            self.source
        );
        for entry in &self.report.delays {
            line.push_str(&format!(" {}:{:.3}", entry.peer, entry.delay_ms));
        }
        line
    }

    fn render_json(&self) -> String {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            received_at: String,
            source: String,
            #[serde(flatten)]
            report: &'a Report,
        }
        let output = JsonOutput {
            received_at: self.received_at.to_rfc3339(),
            source: self.source.to_string(),
            report: &self.report,
        };
        serde_json::to_string(&output).unwrap_or_default()
    }
}

/// Entries of a report without the relay name and terminator.
fn delay_entries(report: &Report) -> String {
    report
        .delays
        .iter()
        .map(|entry| format!("{}:{:.6}", entry.peer, entry.delay_ms))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Relay names end up as file names, so path-like names are refused.
fn usable_file_name(name: &str) -> bool {
    !name.contains(['/', '\\', '\0']) && name != "." && name != ".."
}

fn persist(dir: &Path, entry: &CollectedReport) -> std::io::Result<()> {
    let name = &entry.report.name;
    let entries = delay_entries(&entry.report);

    let delays_dir = dir.join("delays");
    let logs_dir = dir.join("logs");
    fs::create_dir_all(&delays_dir)?;
    fs::create_dir_all(&logs_dir)?;

    fs::write(delays_dir.join(name), format!("{}\n", entries))?;

    let mut history = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(name))?;
    writeln!(history, "{}\t{}", entry.received_at.to_rfc3339(), entries)
}

/// Receives relay reports on one UDP socket.
///
/// The collector trusts its network: any sender may report under any name,
/// up to [`MAX_RELAYS`] distinct names.
pub struct Collector {
    socket: UdpSocket,
    format: OutputFormat,
    latest: HashMap<String, CollectedReport>,
    output_dir: Option<PathBuf>,
}

impl Collector {
    pub async fn bind(addr: SocketAddr, format: OutputFormat) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Collector {
            socket,
            format,
            latest: HashMap::new(),
            output_dir: None,
        })
    }

    /// Also writes every accepted report below `dir`.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Latest report received from the relay called `name`.
    pub fn latest(&self, name: &str) -> Option<&CollectedReport> {
        self.latest.get(name)
    }

    pub fn relay_count(&self) -> usize {
        self.latest.len()
    }

    /// Parses one datagram and stores it as the relay's latest report.
    pub fn handle_datagram(
        &mut self,
        data: &[u8],
        source: SocketAddr,
    ) -> Result<&CollectedReport, CollectorError> {
        let report = self.admit(Report::from_bytes(data)?)?;
        Ok(self.store(report, source))
    }

    fn admit(&self, report: Report) -> Result<Report, CollectorError> {
        if self.latest.len() >= MAX_RELAYS && !self.latest.contains_key(&report.name) {
            return Err(CollectorError::TooManyRelays(report.name));
        }
        Ok(report)
    }

    fn store(&mut self, report: Report, source: SocketAddr) -> &CollectedReport {
        let name = report.name.clone();
        let entry = CollectedReport {
            source,
            received_at: Utc::now(),
            report,
        };

        if let Some(dir) = &self.output_dir {
            if !usable_file_name(&name) {
                log::warn!("Not writing report of relay {:?}: unusable file name", name);
            } else if let Err(e) = persist(dir, &entry) {
                log::warn!("Cannot write report of {} to {}: {}", name, dir.display(), e);
            }
        }

        self.latest.insert(name.clone(), entry);
        &self.latest[&name]
    }

    /// Receives one report, stores it and returns it.
    ///
    /// Malformed reports are logged and skipped.
    pub async fn recv_report(&mut self) -> std::io::Result<&CollectedReport> {
        let mut buf = [0u8; 65535];
        loop {
            let (len, src) = self.socket.recv_from(&mut buf).await?;
            let admitted = Report::from_bytes(&buf[..len])
                .map_err(CollectorError::from)
                .and_then(|report| self.admit(report));
            match admitted {
                Ok(report) => return Ok(self.store(report, src)),
                Err(e) => log::warn!("Ignoring report from {}: {}", src, e),
            }
        }
    }

    /// Receives and prints reports until the task is dropped.
    pub async fn run(mut self) {
        if let Ok(addr) = self.socket.local_addr() {
            log::info!("Collector listening on {}", addr);
        }

        let format = self.format;
        loop {
            match self.recv_report().await {
                Ok(entry) => println!("{}", entry.render(format)),
                Err(e) => log::warn!("Collector receive error: {}", e),
            }
        }
    }
}
