//! Delay reports: the text line sent to the collector, and the scheduler that
//! periodically assembles and sends it.
//!
//! Wire format (one UDP datagram, ASCII):
//! ```text
//! <local_name> <peer1>:<delay1> <peer2>:<delay2> ... end
//! ```
//! Delays are fractional milliseconds with six decimal places.

use std::{fmt, net::SocketAddr, str::FromStr, sync::Arc, time::Duration};

use clap::ValueEnum;
use serde::Serialize;
use thiserror::Error;
use tokio::{net::UdpSocket, task::JoinHandle, time::Instant};

use crate::{estimator::DelayTable, peers::PeerRegistry};

/// Default UDP port of the collector.
pub const DEFAULT_COLLECTOR_PORT: u16 = 32032;
/// Default period between two reports.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(20);

/// Marks the end of a report line; never valid as a name.
pub const TERMINATOR: &str = "end";

#[derive(Error, Debug, PartialEq)]
pub enum ReportError {
    #[error("Empty report")]
    Empty,
    #[error("Report is not terminated by '{TERMINATOR}'")]
    MissingTerminator,
    #[error("Malformed entry {0:?}, expected <name>:<delay>")]
    MalformedEntry(String),
    #[error("Invalid delay {value:?} for peer {peer}")]
    InvalidDelay { peer: String, value: String },
    #[error("Report is not valid UTF-8")]
    NotUtf8,
}

/// One peer's published delay.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerDelay {
    pub peer: String,
    pub delay_ms: f64,
}

/// Snapshot of all per-peer estimates of one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    /// Name of the reporting host.
    pub name: String,
    /// Entries in peer index order.
    pub delays: Vec<PeerDelay>,
}

impl Report {
    /// Reads the current estimate of every peer in the registry.
    ///
    /// Only already-published values are read, so this never waits on a Prober.
    pub fn collect(name: &str, registry: &PeerRegistry, table: &DelayTable) -> Self {
        let delays = registry
            .iter()
            .map(|peer| PeerDelay {
                peer: peer.name.clone(),
                delay_ms: table.get(peer.index).unwrap_or_default(),
            })
            .collect();

        Report {
            name: name.to_string(),
            delays,
        }
    }

    /// Parses a report from raw datagram bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ReportError> {
        std::str::from_utf8(buf)
            .map_err(|_| ReportError::NotUtf8)?
            .parse()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ", self.name)?;
        for entry in &self.delays {
            write!(f, "{}:{:.6} ", entry.peer, entry.delay_ms)?;
        }
        write!(f, "{} ", TERMINATOR)
    }
}

impl FromStr for Report {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Anything after the terminator (e.g. NUL padding) is ignored.
        let mut tokens = s.split_whitespace();
        let name = tokens.next().ok_or(ReportError::Empty)?;
        if name == TERMINATOR {
            return Err(ReportError::Empty);
        }

        let mut delays = Vec::new();
        for token in tokens {
            if token == TERMINATOR {
                return Ok(Report {
                    name: name.to_string(),
                    delays,
                });
            }
            let (peer, value) = token
                .rsplit_once(':')
                .filter(|(peer, _)| !peer.is_empty())
                .ok_or_else(|| ReportError::MalformedEntry(token.to_string()))?;
            let delay_ms = value
                .parse::<f64>()
                .ok()
                .filter(|delay| delay.is_finite() && *delay >= 0.0)
                .ok_or_else(|| ReportError::InvalidDelay {
                    peer: peer.to_string(),
                    value: value.to_string(),
                })?;
            delays.push(PeerDelay {
                peer: peer.to_string(),
                delay_ms,
            });
        }

        Err(ReportError::MissingTerminator)
    }
}

/// When reports are emitted.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, ValueEnum)]
pub enum ReportMode {
    /// Send a report every interval for the lifetime of the process.
    #[default]
    Periodic,
    /// Send a single report once the probers finish (at most one interval) and stop.
    Once,
}

/// Assembles reports from the delay table and sends them to the collector.
pub struct Reporter {
    name: String,
    registry: Arc<PeerRegistry>,
    table: Arc<DelayTable>,
    socket: UdpSocket,
    collector: SocketAddr,
    interval: Duration,
    mode: ReportMode,
}

impl Reporter {
    pub async fn new(
        name: String,
        registry: Arc<PeerRegistry>,
        table: Arc<DelayTable>,
        collector: SocketAddr,
        interval: Duration,
        mode: ReportMode,
    ) -> std::io::Result<Self> {
        let bind_addr: SocketAddr = if collector.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;

        Ok(Reporter {
            name,
            registry,
            table,
            socket,
            collector,
            interval,
            mode,
        })
    }

    pub fn build_report(&self) -> Report {
        Report::collect(&self.name, &self.registry, &self.table)
    }

    /// Builds and sends one report, returning what was sent.
    pub async fn send_report(&self) -> std::io::Result<Report> {
        let report = self.build_report();
        let line = report.to_string();
        self.socket.send_to(line.as_bytes(), self.collector).await?;
        log::info!("Report sent to {}: {}", self.collector, line.trim_end());
        Ok(report)
    }

    /// Sends reports according to the configured mode.
    ///
    /// In once mode the report goes out as soon as every task in `probers`
    /// has finished, or after one interval, whichever comes first. Periodic
    /// mode leaves the probers running and never returns. Send failures are
    /// logged and do not affect later reports.
    pub async fn run(self, probers: Vec<JoinHandle<Option<f64>>>) {
        match self.mode {
            ReportMode::Once => {
                let deadline = Instant::now() + self.interval;
                for handle in probers {
                    if tokio::time::timeout_at(deadline, handle).await.is_err() {
                        log::debug!("Report interval elapsed before all probers finished");
                        break;
                    }
                }
                if let Err(e) = self.send_report().await {
                    log::warn!("Failed to send report to {}: {}", self.collector, e);
                }
            }
            ReportMode::Periodic => {
                let mut timer = tokio::time::interval(self.interval);
                // Skip the first immediate tick
                timer.tick().await;
                loop {
                    timer.tick().await;
                    if let Err(e) = self.send_report().await {
                        log::warn!("Failed to send report to {}: {}", self.collector, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::validate_name;
    use proptest::prelude::*;

    fn two_peers() -> (Arc<PeerRegistry>, Arc<DelayTable>) {
        let registry = PeerRegistry::from_pairs([
            ("A", SocketAddr::from(([10, 0, 0, 1], 32000))),
            ("B", SocketAddr::from(([10, 0, 0, 2], 32000))),
        ])
        .unwrap();
        let table = Arc::new(DelayTable::new(registry.len()));
        (Arc::new(registry), table)
    }

    #[test]
    fn test_report_text_format() {
        let (registry, table) = two_peers();
        table.claim(0).unwrap().publish(12.3);
        table.claim(1).unwrap().publish(45.6);

        let report = Report::collect("R1", &registry, &table);
        assert_eq!(report.to_string(), "R1 A:12.300000 B:45.600000 end ");
    }

    #[test]
    fn test_report_parses_back() {
        let report: Report = "R1 A:12.300000 B:45.600000 end ".parse().unwrap();
        assert_eq!(report.name, "R1");
        assert_eq!(
            report.delays,
            vec![
                PeerDelay {
                    peer: "A".into(),
                    delay_ms: 12.3,
                },
                PeerDelay {
                    peer: "B".into(),
                    delay_ms: 45.6,
                },
            ]
        );
        assert_eq!(report.to_string(), "R1 A:12.300000 B:45.600000 end ");
    }

    #[test]
    fn test_unpublished_peers_report_zero() {
        let (registry, table) = two_peers();
        let report = Report::collect("R1", &registry, &table);
        assert_eq!(report.to_string(), "R1 A:0.000000 B:0.000000 end ");
    }

    #[test]
    fn test_no_peers() {
        let report: Report = "R1 end ".parse().unwrap();
        assert!(report.delays.is_empty());
        assert_eq!(report.to_string(), "R1 end ");
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let report = Report::from_bytes(b"R2 C:1.500000 end \0\0\0").unwrap();
        assert_eq!(report.delays[0].delay_ms, 1.5);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!("".parse::<Report>(), Err(ReportError::Empty));
        assert_eq!("   ".parse::<Report>(), Err(ReportError::Empty));
        assert_eq!("end".parse::<Report>(), Err(ReportError::Empty));
        assert_eq!(
            "R1 A:1.0".parse::<Report>(),
            Err(ReportError::MissingTerminator)
        );
        assert_eq!(
            "R1 A1.0 end".parse::<Report>(),
            Err(ReportError::MalformedEntry("A1.0".into()))
        );
        assert_eq!(
            "R1 :1.0 end".parse::<Report>(),
            Err(ReportError::MalformedEntry(":1.0".into()))
        );
        assert_eq!(
            "R1 A:fast end".parse::<Report>(),
            Err(ReportError::InvalidDelay {
                peer: "A".into(),
                value: "fast".into()
            })
        );
        assert_eq!(Report::from_bytes(&[0xff, 0xfe]), Err(ReportError::NotUtf8));
    }

    #[test]
    fn test_non_finite_or_negative_delay_rejected() {
        for value in ["NaN", "inf", "-inf", "-0.5"] {
            let line = format!("R1 A:{} end", value);
            assert_eq!(
                line.parse::<Report>(),
                Err(ReportError::InvalidDelay {
                    peer: "A".into(),
                    value: value.into()
                })
            );
        }
        let report: Report = "R1 A:0.000000 end".parse().unwrap();
        assert_eq!(report.delays[0].delay_ms, 0.0);
    }

    #[tokio::test]
    async fn test_send_report_reaches_collector() {
        let (registry, table) = two_peers();
        table.claim(1).unwrap().publish(3.25);

        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reporter = Reporter::new(
            "R1".into(),
            registry,
            table,
            collector.local_addr().unwrap(),
            Duration::from_secs(20),
            ReportMode::Periodic,
        )
        .await
        .unwrap();

        let sent = reporter.send_report().await.unwrap();

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(5), collector.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let received = Report::from_bytes(&buf[..len]).unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.delays[1].delay_ms, 3.25);
    }

    async fn once_reporter(interval: Duration) -> (Reporter, UdpSocket) {
        let (registry, table) = two_peers();
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reporter = Reporter::new(
            "R9".into(),
            registry,
            table,
            collector.local_addr().unwrap(),
            interval,
            ReportMode::Once,
        )
        .await
        .unwrap();
        (reporter, collector)
    }

    #[tokio::test]
    async fn test_once_mode_reports_when_probers_finish() {
        // Far longer than the test timeout: only finished probers can release it.
        let (reporter, collector) = once_reporter(Duration::from_secs(3600)).await;
        let probers = vec![
            tokio::spawn(async { Some(1.0) }),
            tokio::spawn(async { None }),
        ];

        tokio::time::timeout(Duration::from_secs(5), reporter.run(probers))
            .await
            .expect("once mode returns after probers finish");

        let mut buf = [0u8; 512];
        let (len, _) = collector.recv_from(&mut buf).await.unwrap();
        assert_eq!(Report::from_bytes(&buf[..len]).unwrap().name, "R9");
    }

    #[tokio::test]
    async fn test_once_mode_reports_after_one_interval() {
        let (reporter, collector) = once_reporter(Duration::from_millis(50)).await;
        let stuck = tokio::spawn(std::future::pending::<Option<f64>>());

        tokio::time::timeout(Duration::from_secs(5), reporter.run(vec![stuck]))
            .await
            .expect("once mode returns after one interval");

        let mut buf = [0u8; 512];
        let (len, _) = collector.recv_from(&mut buf).await.unwrap();
        assert_eq!(Report::from_bytes(&buf[..len]).unwrap().name, "R9");
    }

    proptest! {
        #[test]
        fn accepted_names_survive_the_text_format(
            name in "[a-z]{1,6}",
            peer in "[a-z]{1,6}",
            delay in 0.0f64..100_000.0,
        ) {
            prop_assume!(validate_name(&name).is_ok() && validate_name(&peer).is_ok());
            let report = Report {
                name: name.clone(),
                delays: vec![PeerDelay { peer: peer.clone(), delay_ms: delay }],
            };
            let parsed: Report = report.to_string().parse().unwrap();
            prop_assert_eq!(parsed.name, name);
            prop_assert_eq!(&parsed.delays[0].peer, &peer);
            prop_assert!((parsed.delays[0].delay_ms - delay).abs() < 1e-6);
        }
    }
}
