//! Showback ledger types.

use serde::{Deserialize, Serialize};

/// Cost and usage of one VM in one calendar month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ShowbackRecord {
    pub vmid: i64,
    pub vmname: String,
    pub uid: i64,
    pub gid: i64,
    pub uname: String,
    pub gname: String,
    pub year: i32,
    pub month: u32,
    pub cost: f64,
    pub hours: f64,
}

/// A calendar month, used to bound showback dumps and computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct YearMonth {
    pub year: i32,
    /// 1-based month
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    /// Parse `MM/YYYY` or `YYYY-MM`.
    pub fn parse(s: &str) -> Option<Self> {
        let (year, month) = if let Some((m, y)) = s.split_once('/') {
            (y.trim().parse().ok()?, m.trim().parse().ok()?)
        } else {
            let (y, m) = s.split_once('-')?;
            (y.trim().parse().ok()?, m.trim().parse().ok()?)
        };
        if !(1..=12).contains(&month) {
            return None;
        }
        Some(Self { year, month })
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// Optional bounds of a showback computation or dump.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShowbackRange {
    pub start: Option<YearMonth>,
    pub end: Option<YearMonth>,
}

impl ShowbackRange {
    pub fn new(start: Option<YearMonth>, end: Option<YearMonth>) -> Self {
        Self { start, end }
    }

    /// A single calendar month.
    pub fn month(year: i32, month: u32) -> Self {
        let ym = YearMonth::new(year, month);
        Self { start: Some(ym), end: Some(ym) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_year_month_parse() {
        assert_eq!(YearMonth::parse("1/2024"), Some(YearMonth::new(2024, 1)));
        assert_eq!(YearMonth::parse("2023-12"), Some(YearMonth::new(2023, 12)));
        assert_eq!(YearMonth::parse("13/2024"), None);
        assert_eq!(YearMonth::parse("2024"), None);
    }

    #[test]
    fn test_showback_body_field_names() {
        let record = ShowbackRecord {
            vmid: 7,
            vmname: "web".to_string(),
            uid: 1,
            gid: 2,
            uname: "alice".to_string(),
            gname: "users".to_string(),
            year: 2024,
            month: 1,
            cost: 48.0,
            hours: 240.0,
        };
        let value = serde_json::to_value(&record).unwrap();
        for field in
            ["VMID", "VMNAME", "UID", "GID", "UNAME", "GNAME", "YEAR", "MONTH", "COST", "HOURS"]
        {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }
}
