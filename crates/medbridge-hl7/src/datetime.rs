//! HL7日期时间解析与格式化
//!
//! 支持的精度: YYYYMMDD / YYYYMMDDHHMM / YYYYMMDDHHMMSS,
//! 尾部的小数秒与时区偏移被忽略, 解码阶段永不失败。

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// 解析HL7时间戳
pub fn parse_hl7_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    // 截断小数秒与时区偏移
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();

    match digits.len() {
        n if n >= 14 => NaiveDateTime::parse_from_str(&digits[..14], "%Y%m%d%H%M%S").ok(),
        12 | 13 => NaiveDateTime::parse_from_str(&digits[..12], "%Y%m%d%H%M").ok(),
        8..=11 => NaiveDate::parse_from_str(&digits[..8], "%Y%m%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0)),
        _ => None,
    }
    .map(|naive| Utc.from_utc_datetime(&naive))
}

/// 解析HL7日期 (YYYYMMDD)
pub fn parse_hl7_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.len() < 8 {
        return None;
    }
    NaiveDate::parse_from_str(&s[..8], "%Y%m%d").ok()
}

/// 格式化为HL7时间戳 (YYYYMMDDHHmmss)
pub fn format_hl7_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y%m%d%H%M%S").to_string()
}

/// 格式化为HL7日期 (YYYYMMDD)
pub fn format_hl7_date(d: NaiveDate) -> String {
    d.format("%Y%m%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_full_timestamp() {
        let dt = parse_hl7_datetime("20240115103000").unwrap();
        assert_eq!(format_hl7_datetime(dt), "20240115103000");
    }

    #[test]
    fn test_parse_minute_precision() {
        let dt = parse_hl7_datetime("202401151030").unwrap();
        assert_eq!(dt.second(), 0);
    }

    #[test]
    fn test_parse_date_only() {
        let dt = parse_hl7_datetime("20240115").unwrap();
        assert_eq!(dt.hour(), 0);
    }

    #[test]
    fn test_parse_with_timezone_suffix() {
        // 时区偏移被忽略
        let dt = parse_hl7_datetime("20240115103000+0200").unwrap();
        assert_eq!(format_hl7_datetime(dt), "20240115103000");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_hl7_datetime("").is_none());
        assert!(parse_hl7_datetime("2024").is_none());
        assert!(parse_hl7_datetime("20241332").is_none());
    }

    #[test]
    fn test_parse_date() {
        let d = parse_hl7_date("19800115").unwrap();
        assert_eq!(format_hl7_date(d), "19800115");
    }
}
