//! Parsing of relay process output into live channel metrics.
//!
//! The relay is started with JSON statistics enabled, so the primary signal
//! is a structured stats object per reporting interval. Plain-text markers
//! (`RECEIVING: 4.2`, `SENDING: 4.1`, `dropped: 3`) are still recognised for
//! relay builds that cannot print JSON.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

static RECEIVING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bRECEIVING:\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex")
});
static SENDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bSENDING:\s*([0-9]+(?:\.[0-9]+)?)").expect("valid regex")
});
static DROPPED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bdropped(?:\s+packets)?\s*[:=]\s*([0-9]+)").expect("valid regex")
});

/// Metrics extracted from a single output line.
///
/// Bitrates are kbps. `dropped_packets` is the number of packets dropped
/// during the reporting interval the line describes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RelaySample {
    pub input_kbps: Option<i32>,
    pub output_kbps: Option<i32>,
    pub dropped_packets: Option<i64>,
}

impl RelaySample {
    pub fn is_empty(&self) -> bool {
        self.input_kbps.is_none() && self.output_kbps.is_none() && self.dropped_packets.is_none()
    }
}

/// Coarse classification of a relay line, used to decide which lines are
/// worth surfacing in the server log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Connected,
    ConnectionIssue,
    Error,
    Ready,
    Other,
}

// ---------------------------------------------------------------------------
// JSON stats objects
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct JsonStats {
    send: Option<JsonDirection>,
    recv: Option<JsonDirection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonDirection {
    mbit_rate: Option<f64>,
    packets_dropped: Option<i64>,
}

/// Extract metrics from one line of relay output.
///
/// Returns `None` when the line carries no metrics at all.
pub fn parse_line(line: &str) -> Option<RelaySample> {
    let line = line.trim();
    let sample = if line.starts_with('{') {
        parse_json(line)?
    } else {
        parse_text(line)
    };
    (!sample.is_empty()).then_some(sample)
}

fn parse_json(line: &str) -> Option<RelaySample> {
    let stats: JsonStats = serde_json::from_str(line).ok()?;
    let recv = stats.recv.as_ref();
    let send = stats.send.as_ref();

    let dropped = match (
        recv.and_then(|r| r.packets_dropped),
        send.and_then(|s| s.packets_dropped),
    ) {
        (None, None) => None,
        (r, s) => Some(r.unwrap_or(0).saturating_add(s.unwrap_or(0))),
    };

    Some(RelaySample {
        input_kbps: recv.and_then(|r| r.mbit_rate).map(mbps_to_kbps),
        output_kbps: send.and_then(|s| s.mbit_rate).map(mbps_to_kbps),
        dropped_packets: dropped,
    })
}

fn parse_text(line: &str) -> RelaySample {
    let capture_f64 = |re: &Regex| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
    };

    RelaySample {
        input_kbps: capture_f64(&RECEIVING_RE).map(mbps_to_kbps),
        output_kbps: capture_f64(&SENDING_RE).map(mbps_to_kbps),
        dropped_packets: DROPPED_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok()),
    }
}

fn mbps_to_kbps(mbps: f64) -> i32 {
    (mbps * 1000.0).round().clamp(0.0, i32::MAX as f64) as i32
}

/// Classify a relay line by the connection events it mentions.
pub fn classify(line: &str) -> LineKind {
    let lower = line.to_lowercase();
    if lower.contains("accepted") || lower.contains("connected") && !lower.contains("disconnected")
    {
        LineKind::Connected
    } else if lower.contains("disconnected") || lower.contains("broken") {
        LineKind::ConnectionIssue
    } else if lower.contains("error") {
        LineKind::Error
    } else if lower.contains("listening") || lower.contains("ready") {
        LineKind::Ready
    } else {
        LineKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_stats_object() {
        let line = r#"{"sid":1,"time":1000,"send":{"packets":10,"packetsDropped":1,"mbitRate":4.1},"recv":{"packets":12,"packetsDropped":2,"mbitRate":4.25}}"#;
        let sample = parse_line(line).unwrap();
        assert_eq!(sample.input_kbps, Some(4250));
        assert_eq!(sample.output_kbps, Some(4100));
        assert_eq!(sample.dropped_packets, Some(3));
    }

    #[test]
    fn huge_drop_counters_saturate() {
        let line = format!(
            r#"{{"send":{{"packetsDropped":{max}}},"recv":{{"packetsDropped":{max}}}}}"#,
            max = i64::MAX
        );
        assert_eq!(parse_line(&line).unwrap().dropped_packets, Some(i64::MAX));
    }

    #[test]
    fn json_without_metrics_is_ignored() {
        assert_eq!(parse_line(r#"{"sid":1}"#), None);
        assert_eq!(parse_line("{not json"), None);
    }

    #[test]
    fn parses_text_markers() {
        let sample = parse_line("RECEIVING: 4.20 Mbps SENDING: 4.1 Mbps dropped: 7").unwrap();
        assert_eq!(sample.input_kbps, Some(4200));
        assert_eq!(sample.output_kbps, Some(4100));
        assert_eq!(sample.dropped_packets, Some(7));
    }

    #[test]
    fn partial_text_markers() {
        let sample = parse_line("SENDING: 12").unwrap();
        assert_eq!(sample.input_kbps, None);
        assert_eq!(sample.output_kbps, Some(12000));
    }

    #[test]
    fn plain_lines_have_no_metrics() {
        assert_eq!(parse_line("Media path: 'srt://src:4000' --> 'udp://239.1.1.1:5000'"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn classifies_connection_events() {
        assert_eq!(classify("SRT source connected"), LineKind::Connected);
        assert_eq!(classify("Accepted SRT source connection"), LineKind::Connected);
        assert_eq!(classify("SRT source disconnected"), LineKind::ConnectionIssue);
        assert_eq!(classify("Connection broken"), LineKind::ConnectionIssue);
        assert_eq!(classify("ERROR: bind failed"), LineKind::Error);
        assert_eq!(classify("Listening on port 9000"), LineKind::Ready);
        assert_eq!(classify("RECEIVING: 1.0"), LineKind::Other);
    }
}
