//! GRBL status report parsing
//!
//! Status reports look like `<Idle|MPos:1.000,2.000,0.000|Bf:15,128|WCO:0,0,0>`.
//! Fields are `|`-separated `KEY:csv` pairs after the machine state word.

use serde::{Deserialize, Serialize};

/// Everything extracted from one status report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrblStatus {
    /// Machine state word (Idle, Run, Hold:0...)
    pub state: Option<String>,
    /// Machine position
    pub mpos: Option<[f64; 3]>,
    /// Work position
    pub wpos: Option<[f64; 3]>,
    /// Work coordinate offset
    pub wco: Option<[f64; 3]>,
    /// Planner blocks and RX bytes available
    pub buffer: Option<(u32, u32)>,
    /// Current feed rate
    pub feed: Option<f64>,
}

impl GrblStatus {
    /// Work position, derived from MPos and WCO when not reported directly
    pub fn work_position(&self) -> Option<[f64; 3]> {
        self.wpos.or_else(|| {
            let (m, o) = (self.mpos?, self.wco?);
            Some([m[0] - o[0], m[1] - o[1], m[2] - o[2]])
        })
    }
}

/// GRBL status report parser
pub struct StatusParser;

impl StatusParser {
    /// True for a complete `<...>` report
    pub fn is_status_report(line: &str) -> bool {
        line.len() >= 2 && line.starts_with('<') && line.ends_with('>')
    }

    /// Machine state word, e.g. `Idle` from `<Idle|...>` or `<Idle>`
    pub fn parse_machine_state(status_line: &str) -> Option<String> {
        let inner = Self::inner(status_line);
        let end = inner.find('|').unwrap_or(inner.len());
        let state = inner[..end].trim();
        (!state.is_empty()).then(|| state.to_string())
    }

    /// Machine position
    pub fn parse_mpos(status_line: &str) -> Option<[f64; 3]> {
        Self::extract_field(status_line, "MPos:").and_then(Self::parse_axes)
    }

    /// Work position
    pub fn parse_wpos(status_line: &str) -> Option<[f64; 3]> {
        Self::extract_field(status_line, "WPos:").and_then(Self::parse_axes)
    }

    /// Work coordinate offset
    pub fn parse_wco(status_line: &str) -> Option<[f64; 3]> {
        Self::extract_field(status_line, "WCO:").and_then(Self::parse_axes)
    }

    /// `Bf:planner,rx` buffer availability
    pub fn parse_buffer(status_line: &str) -> Option<(u32, u32)> {
        let field = Self::extract_field(status_line, "Bf:")?;
        let (plan, rx) = field.split_once(',')?;
        Some((plan.trim().parse().ok()?, rx.trim().parse().ok()?))
    }

    /// Feed rate from `F:` or the first value of `FS:`
    pub fn parse_feed_rate(status_line: &str) -> Option<f64> {
        if let Some(rate) = Self::extract_field(status_line, "F:") {
            return rate.trim().parse().ok();
        }
        let fs = Self::extract_field(status_line, "FS:")?;
        fs.split(',').next()?.trim().parse().ok()
    }

    /// Parse every known field
    pub fn parse_full(status_line: &str) -> GrblStatus {
        GrblStatus {
            state: Self::parse_machine_state(status_line),
            mpos: Self::parse_mpos(status_line),
            wpos: Self::parse_wpos(status_line),
            wco: Self::parse_wco(status_line),
            buffer: Self::parse_buffer(status_line),
            feed: Self::parse_feed_rate(status_line),
        }
    }

    fn inner(status_line: &str) -> &str {
        let line = status_line.trim();
        let line = line.strip_prefix('<').unwrap_or(line);
        line.strip_suffix('>').unwrap_or(line)
    }

    fn parse_axes(field: &str) -> Option<[f64; 3]> {
        let coords: Vec<f64> = field
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .ok()?;
        if coords.len() < 3 {
            return None;
        }
        Some([coords[0], coords[1], coords[2]])
    }

    fn extract_field<'a>(status_line: &'a str, field_prefix: &str) -> Option<&'a str> {
        let inner = Self::inner(status_line);
        inner.split('|').skip(1).find_map(|f| f.strip_prefix(field_prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_report() {
        let status = StatusParser::parse_full(
            "<Run|MPos:10.000,20.000,-1.500|Bf:15,128|FS:500,0|WCO:2.000,3.000,-0.500>",
        );
        assert_eq!(status.state.as_deref(), Some("Run"));
        assert_eq!(status.mpos, Some([10.0, 20.0, -1.5]));
        assert_eq!(status.wco, Some([2.0, 3.0, -0.5]));
        assert_eq!(status.buffer, Some((15, 128)));
        assert_eq!(status.feed, Some(500.0));
        assert_eq!(status.work_position(), Some([8.0, 17.0, -1.0]));
    }

    #[test]
    fn test_reported_wpos_wins() {
        let status = StatusParser::parse_full("<Idle|WPos:1,2,3|WCO:5,5,5>");
        assert_eq!(status.work_position(), Some([1.0, 2.0, 3.0]));
        assert_eq!(status.mpos, None);
    }

    #[test]
    fn test_state_only() {
        assert_eq!(StatusParser::parse_machine_state("<Idle>").as_deref(), Some("Idle"));
        assert_eq!(
            StatusParser::parse_machine_state("<Hold:0|MPos:0,0,0>").as_deref(),
            Some("Hold:0")
        );
    }

    #[test]
    fn test_malformed_fields_are_skipped() {
        let status = StatusParser::parse_full("<Idle|MPos:1,x,3|Bf:15>");
        assert_eq!(status.mpos, None);
        assert_eq!(status.buffer, None);
        assert!(StatusParser::is_status_report("<Idle>"));
        assert!(!StatusParser::is_status_report("<Idle"));
    }
}
