//! Core domain model for vacwatch: tracked properties, per-run snapshots and
//! the move-in period vocabulary shared by the scraper and the notifier.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, SubsecRound, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vacwatch-core";

pub const PROPERTY_ID_PREFIX: &str = "property_";
pub const IMMEDIATE_KEY: &str = "即入居可";
pub const NEGOTIABLE_KEY: &str = "相談";

const JST_OFFSET_SECS: i32 = 9 * 3600;

/// Move-in period label -> number of units listed with that period.
pub type MoveInBreakdown = BTreeMap<String, u32>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub name: String,
    pub url: String,
}

impl Property {
    /// Builds a record from a listing URL, or `None` when the URL carries no
    /// trailing `to_<digits>` segment.
    pub fn from_listing_url(name: impl Into<String>, url: impl Into<String>) -> Option<Self> {
        let url = url.into();
        let id = property_id_from_url(&url)?;
        Some(Self {
            id,
            name: name.into(),
            url,
        })
    }
}

fn listing_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/to_([0-9]+)/?$").expect("listing id pattern is valid"))
}

/// Derives `property_<digits>` from URLs shaped like
/// `https://suumo.jp/library/tf_27/sc_27107/to_1002461672/`.
pub fn property_id_from_url(url: &str) -> Option<String> {
    listing_id_regex()
        .captures(url.trim())
        .and_then(|caps| caps.get(1))
        .map(|digits| format!("{PROPERTY_ID_PREFIX}{}", digits.as_str()))
}

/// Result of scraping one property during one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertySnapshot {
    pub id: String,
    pub name: String,
    pub url: String,
    pub count: u32,
    #[serde(default)]
    pub move_in_breakdown: MoveInBreakdown,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PropertySnapshot {
    pub fn succeeded(property: &Property, count: u32, move_in_breakdown: MoveInBreakdown) -> Self {
        Self {
            id: property.id.clone(),
            name: property.name.clone(),
            url: property.url.clone(),
            count,
            move_in_breakdown,
            success: true,
            error: None,
        }
    }

    /// Failed captures carry a zero count and an empty breakdown.
    pub fn failed(property: &Property, error: impl Into<String>) -> Self {
        Self {
            id: property.id.clone(),
            name: property.name.clone(),
            url: property.url.clone(),
            count: 0,
            move_in_breakdown: MoveInBreakdown::new(),
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn breakdown_total(&self) -> u32 {
        self.move_in_breakdown.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<FixedOffset>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub properties: Vec<PropertySnapshot>,
}

impl HistoryEntry {
    pub fn new(at: DateTime<FixedOffset>, properties: Vec<PropertySnapshot>) -> Self {
        let at = at.trunc_subsecs(0);
        Self {
            timestamp: at,
            date: at.date_naive(),
            time: at.time(),
            properties,
        }
    }

    pub fn successful(&self) -> usize {
        self.properties.iter().filter(|p| p.success).count()
    }

    pub fn property(&self, id: &str) -> Option<&PropertySnapshot> {
        self.properties.iter().find(|p| p.id == id)
    }
}

pub fn jst() -> FixedOffset {
    FixedOffset::east_opt(JST_OFFSET_SECS).expect("JST offset is within range")
}

pub fn now_jst() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&jst()).trunc_subsecs(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MonthPart {
    Early,
    Middle,
    Late,
}

impl MonthPart {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "上旬" => Some(Self::Early),
            "中旬" => Some(Self::Middle),
            "下旬" => Some(Self::Late),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Early => "上旬",
            Self::Middle => "中旬",
            Self::Late => "下旬",
        }
    }
}

/// Classified move-in cell. Dated periods keep the year and month digits
/// as the site printed them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MoveInPeriod {
    Immediate,
    Negotiable,
    Dated {
        year: String,
        month: String,
        part: Option<MonthPart>,
    },
}

impl MoveInPeriod {
    pub fn key(&self) -> String {
        match self {
            Self::Immediate => IMMEDIATE_KEY.to_string(),
            Self::Negotiable => NEGOTIABLE_KEY.to_string(),
            Self::Dated { year, month, part } => {
                let part = part.map(MonthPart::label).unwrap_or_default();
                format!("{year}年{month}月{part}")
            }
        }
    }
}

impl fmt::Display for MoveInPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn dated_cell_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^['’]?([0-9]{2})年([0-9]{1,2})月([上中下]旬)?$")
            .expect("dated cell pattern is valid")
    })
}

// Ideographic spaces count as whitespace.
pub fn squash_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Classifies raw table-cell text. Returns `None` for cells that are not a
/// move-in period.
pub fn classify_cell(raw: &str) -> Option<MoveInPeriod> {
    let text = squash_whitespace(raw);
    match text.as_str() {
        "即入居可" | "即" => return Some(MoveInPeriod::Immediate),
        "相談" => return Some(MoveInPeriod::Negotiable),
        _ => {}
    }

    let caps = dated_cell_regex().captures(&text)?;
    let year = caps.get(1)?.as_str().to_string();
    let month = caps.get(2)?.as_str().to_string();
    let part = match caps.get(3) {
        Some(m) => Some(MonthPart::from_label(m.as_str())?),
        None => None,
    };
    Some(MoveInPeriod::Dated { year, month, part })
}

/// Counts classified cells; unclassified cells are ignored.
pub fn tally_cells<I, S>(cells: I) -> MoveInBreakdown
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut breakdown = MoveInBreakdown::new();
    for cell in cells {
        if let Some(period) = classify_cell(cell.as_ref()) {
            *breakdown.entry(period.key()).or_default() += 1;
        }
    }
    breakdown
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} is required but not set")]
    Missing { var: &'static str },
    #[error("{var}={value:?} is invalid: {message}")]
    Invalid {
        var: &'static str,
        value: String,
        message: String,
    },
}

pub fn env_value(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

pub fn env_or(var: &str, default: &str) -> String {
    env_value(var).unwrap_or_else(|| default.to_string())
}

/// Parses `var` when set; unparsable values are an error rather than the default.
pub fn env_parse<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_value(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: e.to_string(),
            value,
        }),
    }
}

/// True only for the literal `true` (any case).
pub fn env_flag(var: &str) -> bool {
    env_value(var).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}
