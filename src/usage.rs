//! Bandwidth usage extraction and threshold checks.
//!
//! Usage arrives three ways, in order of preference: surfaced by the browser
//! session from dashboard text, parsed from the `subscription-userinfo`
//! response header, or scraped out of arbitrary page text. All of them are
//! best-effort; absence is normal and never an error.

use std::collections::BTreeMap;

use regex::Regex;

use crate::model::UsageInfo;

const USAGE_HEADER: &str = "subscription-userinfo";

/// Parse usage from response headers (`subscription-userinfo`).
pub fn from_headers(headers: &BTreeMap<String, String>) -> Option<UsageInfo> {
    let raw = headers
        .iter()
        .find_map(|(k, v)| k.eq_ignore_ascii_case(USAGE_HEADER).then_some(v.as_str()))?;
    parse_userinfo(raw)
}

/// Parse the `upload=..; download=..; total=..` header value. Unknown keys
/// (like `expire`) are ignored; a missing or zero `total` means the header
/// carries nothing useful.
pub fn parse_userinfo(raw: &str) -> Option<UsageInfo> {
    let mut upload = 0u64;
    let mut download = 0u64;
    let mut total = 0u64;
    for part in raw.split(';') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let Ok(n) = value.trim().parse::<u64>() else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "upload" => upload = n,
            "download" => download = n,
            "total" => total = n,
            _ => {}
        }
    }
    (total > 0).then_some(UsageInfo {
        used: upload + download,
        total,
    })
}

/// Scrape usage from dashboard text.
///
/// Two shapes are recognized: labeled values (`已用 4.2 GB ... 总量 100 GB`,
/// `Used: 4.2 GB ... Total: 100 GB`) and the slash form (`4.2 GB / 100 GB`).
/// Labeled values win when both appear.
pub fn from_dashboard_text(text: &str) -> Option<UsageInfo> {
    labeled_usage(text).or_else(|| slash_usage(text))
}

/// True when usage strictly exceeds the threshold fraction. Landing exactly
/// on the threshold does not count.
pub fn threshold_exceeded(usage: &UsageInfo, threshold: f64) -> bool {
    usage.ratio() > threshold
}

/// Human-readable `used / total (pct)` line for logs and alert mails.
pub fn describe(usage: &UsageInfo) -> String {
    format!(
        "{} / {} ({:.1}%)",
        format_bytes(usage.used),
        format_bytes(usage.total),
        usage.ratio() * 100.0
    )
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = 1024.0 * KB;
    const GB: f64 = 1024.0 * MB;
    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GB", b / GB)
    } else if b >= MB {
        format!("{:.2} MB", b / MB)
    } else if b >= KB {
        format!("{:.2} KB", b / KB)
    } else {
        format!("{bytes} B")
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn labeled_usage(text: &str) -> Option<UsageInfo> {
    let used_re = Regex::new(r"(?i)(?:已用|已使用|used)\s*[:：]?\s*([0-9]+(?:\.[0-9]+)?)\s*(B|KB|MB|GB)")
        .expect("used regex is valid");
    let total_re = Regex::new(r"(?i)(?:总量|总流量|total)\s*[:：]?\s*([0-9]+(?:\.[0-9]+)?)\s*(B|KB|MB|GB)")
        .expect("total regex is valid");

    let used = capture_bytes(&used_re.captures(text)?, 1, 2)?;
    let total = capture_bytes(&total_re.captures(text)?, 1, 2)?;
    (total > 0).then_some(UsageInfo { used, total })
}

fn slash_usage(text: &str) -> Option<UsageInfo> {
    let slash_re = Regex::new(
        r"(?i)([0-9]+(?:\.[0-9]+)?)\s*(B|KB|MB|GB)\s*/\s*([0-9]+(?:\.[0-9]+)?)\s*(B|KB|MB|GB)",
    )
    .expect("slash regex is valid");

    let caps = slash_re.captures(text)?;
    let used = capture_bytes(&caps, 1, 2)?;
    let total = capture_bytes(&caps, 3, 4)?;
    (total > 0).then_some(UsageInfo { used, total })
}

fn capture_bytes(caps: &regex::Captures<'_>, value_group: usize, unit_group: usize) -> Option<u64> {
    let value: f64 = caps.get(value_group)?.as_str().parse().ok()?;
    let unit = caps.get(unit_group)?.as_str();
    Some(to_bytes(value, unit))
}

fn to_bytes(value: f64, unit: &str) -> u64 {
    let factor = match unit.to_ascii_uppercase().as_str() {
        "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    };
    (value * factor).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("subscription-userinfo".to_string(), value.to_string());
        map
    }

    #[test]
    fn header_usage_sums_upload_and_download() {
        let usage = from_headers(&headers("upload=100; download=50; total=1000")).unwrap();
        assert_eq!(usage.used, 150);
        assert_eq!(usage.total, 1000);
        assert!(threshold_exceeded(&usage, 0.1));
    }

    #[test]
    fn header_requires_positive_total() {
        assert_eq!(from_headers(&headers("upload=100; download=50; total=0")), None);
        assert_eq!(from_headers(&headers("upload=100; download=50")), None);
        assert_eq!(from_headers(&BTreeMap::new()), None);
    }

    #[test]
    fn header_key_lookup_ignores_case_and_extra_keys() {
        let mut map = BTreeMap::new();
        map.insert(
            "Subscription-Userinfo".to_string(),
            "upload=1;download=2;total=10;expire=1719000000".to_string(),
        );
        let usage = from_headers(&map).unwrap();
        assert_eq!(usage.used, 3);
        assert_eq!(usage.total, 10);
    }

    #[test]
    fn labeled_chinese_text_is_parsed() {
        let usage = from_dashboard_text("流量详情 已用 4.2 GB 总量 100 GB 重置日期 1 号").unwrap();
        assert_eq!(usage.used, to_bytes(4.2, "GB"));
        assert_eq!(usage.total, 100 * 1024 * 1024 * 1024);
    }

    #[test]
    fn labeled_english_text_is_parsed() {
        let usage = from_dashboard_text("Used: 10.5 GB of your plan. Total: 100 GB").unwrap();
        assert_eq!(usage.used, to_bytes(10.5, "GB"));
        assert_eq!(usage.total, 100 * 1024 * 1024 * 1024);
    }

    #[test]
    fn slash_form_is_parsed_when_no_labels_match() {
        let usage = from_dashboard_text("本月流量 512 MB / 20 GB").unwrap();
        assert_eq!(usage.used, 512 * 1024 * 1024);
        assert_eq!(usage.total, 20 * 1024 * 1024 * 1024);
    }

    #[test]
    fn unintelligible_text_yields_nothing() {
        assert_eq!(from_dashboard_text("欢迎回来"), None);
        assert_eq!(from_dashboard_text(""), None);
    }

    #[test]
    fn threshold_is_strict() {
        let usage = UsageInfo { used: 500, total: 1000 };
        assert!(!threshold_exceeded(&usage, 0.5));
        let usage = UsageInfo { used: 501, total: 1000 };
        assert!(threshold_exceeded(&usage, 0.5));
    }

    #[test]
    fn byte_conversion_and_formatting() {
        assert_eq!(to_bytes(1.0, "KB"), 1024);
        assert_eq!(to_bytes(1.5, "mb"), 1_572_864);
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(104_857_600), "100.00 MB");
        assert!(describe(&UsageInfo { used: 512, total: 1024 }).contains("50.0%"));
    }
}
