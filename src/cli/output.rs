//! Output formatters for scan results.
//!
//! Supports pretty (nmap-style) and JSON output formats.

use std::time::Duration;

use crate::{PortResult, PortState, ScanResult};

/// Format a scan result as nmap-style pretty text.
pub fn format_pretty(result: &ScanResult, target_input: &str) -> String {
    let mut out = String::new();

    let version = env!("CARGO_PKG_VERSION");
    out.push_str(&format!("Starting halfscan {version}\n"));

    let host_label = if target_input == result.target_ip.to_string() {
        target_input.to_string()
    } else {
        format!("{target_input} ({})", result.target_ip)
    };
    out.push_str(&format!(
        "Scan report for {host_label} via {}\n",
        result.interface
    ));
    out.push('\n');

    out.push_str(&format!("{:<10}{:<10}{}\n", "PORT", "STATE", "RTT"));

    let mut ports: Vec<&PortResult> = result.ports.iter().collect();
    ports.sort_by_key(|p| p.port);

    for port in &ports {
        let rtt_label = match port.duration {
            Some(d) if port.state.had_response() => format_duration(d),
            _ => "-".to_string(),
        };
        out.push_str(&format!(
            "{:<10}{:<10}{}\n",
            format!("{}/tcp", port.port),
            port.state,
            rtt_label
        ));
    }

    out.push('\n');

    let summary_parts: Vec<String> = [
        PortState::Open,
        PortState::Closed,
        PortState::Filtered,
        PortState::Unknown,
    ]
    .into_iter()
    .filter_map(|state| match result.count(state) {
        0 => None,
        n => Some(format!("{n} {state}")),
    })
    .collect();

    let summary = if summary_parts.is_empty() {
        "no results".to_string()
    } else {
        summary_parts.join(", ")
    };

    let duration_s = result.duration_ms as f64 / 1000.0;
    out.push_str(&format!(
        "{} ports reported in {duration_s:.2}s ({summary})\n",
        result.ports.len()
    ));

    out
}

/// Format a scan result as JSON.
pub fn format_json(result: &ScanResult) -> String {
    serde_json::to_string_pretty(&JsonOutput::from(result))
        .unwrap_or_else(|e| format!("{{\"error\": \"serialization failed: {e}\"}}"))
}

/// JSON output structure.
#[derive(serde::Serialize)]
struct JsonOutput<'a> {
    request_id: String,
    target: String,
    interface: &'a str,
    duration_ms: u64,
    scanned_at: String,
    ports: Vec<JsonPort>,
}

#[derive(serde::Serialize)]
struct JsonPort {
    port: u16,
    state: PortState,
    #[serde(skip_serializing_if = "Option::is_none")]
    rtt_us: Option<u64>,
}

impl<'a> From<&'a ScanResult> for JsonOutput<'a> {
    fn from(r: &'a ScanResult) -> Self {
        let mut ports: Vec<JsonPort> = r
            .ports
            .iter()
            .map(|p| JsonPort {
                port: p.port,
                state: p.state,
                rtt_us: p.duration.map(|d| d.as_micros() as u64),
            })
            .collect();
        ports.sort_by_key(|p| p.port);

        Self {
            request_id: r.request_id.to_string(),
            target: r.target_ip.to_string(),
            interface: &r.interface,
            duration_ms: r.duration_ms,
            scanned_at: r.scanned_at.to_rfc3339(),
            ports,
        }
    }
}

/// Format a round-trip time to a human-readable string.
pub fn format_duration(d: Duration) -> String {
    let ns = d.as_nanos();
    if ns >= 1_000_000_000 {
        format!("{:.1}s", ns as f64 / 1_000_000_000.0)
    } else if ns >= 1_000_000 {
        format!("{:.1}ms", ns as f64 / 1_000_000.0)
    } else if ns >= 1_000 {
        format!("{:.1}µs", ns as f64 / 1_000.0)
    } else {
        format!("{ns}ns")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use uuid::Uuid;

    fn make_result(ports: Vec<PortResult>) -> ScanResult {
        ScanResult {
            request_id: Uuid::new_v4(),
            target_ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
            interface: "eth0".to_string(),
            ports,
            duration_ms: 3420,
            scanned_at: Utc::now(),
        }
    }

    fn replied(port: u16, state: PortState, micros: u64) -> PortResult {
        PortResult {
            port,
            state,
            duration: Some(Duration::from_micros(micros)),
        }
    }

    #[test]
    fn test_format_duration_units() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1_500)), "1.5µs");
        assert_eq!(format_duration(Duration::from_micros(1_200)), "1.2ms");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1.5s");
    }

    #[test]
    fn test_format_pretty_header() {
        let output = format_pretty(&make_result(vec![]), "1.2.3.4");
        assert!(output.contains("Starting halfscan"));
        assert!(output.contains("Scan report for 1.2.3.4 via eth0"));
        assert!(output.contains("no results"));
    }

    #[test]
    fn test_format_pretty_hostname_label() {
        let output = format_pretty(&make_result(vec![]), "example.test");
        assert!(output.contains("Scan report for example.test (1.2.3.4)"));
    }

    #[test]
    fn test_format_pretty_open_port() {
        let output = format_pretty(&make_result(vec![replied(80, PortState::Open, 800)]), "1.2.3.4");
        assert!(output.contains("80/tcp"));
        assert!(output.contains("open"));
        assert!(output.contains("800.0µs"));
    }

    #[test]
    fn test_format_pretty_filtered_port_shows_dash() {
        let output = format_pretty(&make_result(vec![PortResult::filtered(8080)]), "1.2.3.4");
        let line = output.lines().find(|l| l.starts_with("8080/tcp")).unwrap();
        assert!(line.contains("filtered"));
        assert!(line.trim_end().ends_with('-'));
    }

    #[test]
    fn test_format_pretty_summary() {
        let result = make_result(vec![
            replied(22, PortState::Open, 1_000),
            replied(80, PortState::Open, 800),
            replied(81, PortState::Closed, 700),
            PortResult::filtered(8080),
        ]);
        let output = format_pretty(&result, "1.2.3.4");
        assert!(output.contains("4 ports reported"));
        assert!(output.contains("2 open, 1 closed, 1 filtered"));
    }

    #[test]
    fn test_format_pretty_sorted_by_port() {
        let result = make_result(vec![
            replied(443, PortState::Open, 1),
            replied(22, PortState::Closed, 1),
        ]);
        let output = format_pretty(&result, "1.2.3.4");
        let first = output.find("22/tcp").unwrap();
        let second = output.find("443/tcp").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_format_json_structure() {
        let result = make_result(vec![
            replied(443, PortState::Open, 900),
            PortResult::filtered(444),
        ]);
        let json = format_json(&result);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["target"], "1.2.3.4");
        assert_eq!(parsed["interface"], "eth0");
        assert_eq!(parsed["duration_ms"], 3420);
        assert_eq!(parsed["request_id"], result.request_id.to_string());
        assert_eq!(parsed["ports"][0]["port"], 443);
        assert_eq!(parsed["ports"][0]["state"], "open");
        assert_eq!(parsed["ports"][0]["rtt_us"], 900);
        assert_eq!(parsed["ports"][1]["state"], "filtered");
        assert!(parsed["ports"][1].get("rtt_us").is_none());
    }
}
