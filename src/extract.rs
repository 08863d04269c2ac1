//! Multi-strategy timestamp extraction.
//!
//! Each chunk gets at most one calendar date, found by the first strategy
//! that both matches and normalizes to a valid `YYYY-MM-DD`:
//!
//! | Order | Strategy | Looks at | Confidence |
//! |-------|----------|----------|------------|
//! | 1 | [`ExtractionStrategy::Filename`] | `YYYY-MM-DD` / `YYYY_MM_DD` in the filename | 1.00 |
//! | 2 | [`ExtractionStrategy::Regex`] | month-day-year, day-month-year | 0.95 |
//! |   |  | month-year | 0.85 |
//! |   |  | numeric `YYYY-MM-DD` | 0.95 |
//! |   |  | bare 4-digit year | 0.60 |
//! | 3 | [`ExtractionStrategy::Entity`] | date phrases in the leading characters | 0.80 |
//! | 4 | [`ExtractionStrategy::Fuzzy`] | 4-word windows of the leading sentences | 0.70 |
//!
//! A match that fails to normalize (e.g. "February 30, 2021") falls through
//! to the next pattern or strategy. Extraction never consults the clock, so
//! identical input always yields identical output. Dates missing a day take
//! day 1; dates missing a month take January.
//!
//! Two-digit years pivot at 69: `'00`–`'68` are 2000s, `'69`–`'99` are 1900s.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::config::ExtractionConfig;
use crate::models::{ExtractedDate, ExtractionStrategy};

const MONTHS: &str = "January|February|March|April|May|June|July|August|September|Sept|October|November|December|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Oct|Nov|Dec";

const FILENAME_CONFIDENCE: f64 = 1.0;
const ENTITY_CONFIDENCE: f64 = 0.80;
const FUZZY_CONFIDENCE: f64 = 0.70;

static RE_FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})[-_](\d{2})[-_](\d{2})").expect("valid regex"));

static RE_MONTH_DAY_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({MONTHS})\.?\s+(\d{{1,2}}),?\s+(\d{{4}})\b")).expect("valid regex")
});
static RE_DAY_MONTH_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(\d{{1,2}})\s+({MONTHS})\.?,?\s+(\d{{4}})\b")).expect("valid regex")
});
static RE_MONTH_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({MONTHS})\.?,?\s+(\d{{4}})\b")).expect("valid regex")
});
static RE_NUMERIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})[-_/](\d{2})[-_/](\d{2})").expect("valid regex"));
static RE_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").expect("valid regex"));

// Entity phrases: ordinals, "the", apostrophe years and slash dates.
static RE_ENT_DAY_MONTH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({MONTHS})\.?,?\s+(\d{{4}}\b|'\d{{2}}\b)"
    ))
    .expect("valid regex")
});
static RE_ENT_MONTH_DAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b({MONTHS})\.?\s+(?:the\s+)?(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}}\b|'\d{{2}}\b)"
    ))
    .expect("valid regex")
});
static RE_ENT_SLASH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})[/.](\d{1,2})[/.](\d{4}|\d{2})\b").expect("valid regex")
});
static RE_ENT_MONTH_SHORT_YEAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b({MONTHS})\.?\s+'(\d{{2}})\b")).expect("valid regex")
});

/// Stateless date extractor configured by `[extraction]`.
#[derive(Debug, Clone)]
pub struct TimestampExtractor {
    entity_window_chars: usize,
    fuzzy_sentences: usize,
    min_year: i32,
    max_year: i32,
}

impl Default for TimestampExtractor {
    fn default() -> Self {
        Self::new(&ExtractionConfig::default())
    }
}

impl TimestampExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            entity_window_chars: config.entity_window_chars,
            fuzzy_sentences: config.fuzzy_sentences,
            min_year: config.min_year,
            max_year: config.max_year,
        }
    }

    /// Run every strategy in order and return the first success.
    pub fn extract(&self, text: &str, filename: Option<&str>) -> ExtractedDate {
        if let Some(date) = filename.and_then(|f| self.from_filename(f)) {
            return ExtractedDate::found(date, ExtractionStrategy::Filename, FILENAME_CONFIDENCE);
        }
        if text.trim().is_empty() {
            return ExtractedDate::failed();
        }
        if let Some((date, confidence)) = self.from_regex(text) {
            return ExtractedDate::found(date, ExtractionStrategy::Regex, confidence);
        }
        if let Some(date) = self.from_entities(text) {
            return ExtractedDate::found(date, ExtractionStrategy::Entity, ENTITY_CONFIDENCE);
        }
        if let Some(date) = self.from_fuzzy(text) {
            return ExtractedDate::found(date, ExtractionStrategy::Fuzzy, FUZZY_CONFIDENCE);
        }
        ExtractedDate::failed()
    }

    pub fn from_filename(&self, filename: &str) -> Option<NaiveDate> {
        let caps = RE_FILENAME.captures(filename)?;
        self.ymd(num(&caps, 1)?, num(&caps, 2)?, num(&caps, 3)?)
    }

    /// Regex patterns in decreasing specificity; first match per pattern.
    pub fn from_regex(&self, text: &str) -> Option<(NaiveDate, f64)> {
        for pattern in TextPattern::ALL {
            if let Some(caps) = pattern.regex().captures(text) {
                match self.normalize(pattern, &caps) {
                    Some(date) => return Some((date, pattern.confidence())),
                    None => tracing::debug!(phrase = &caps[0], "regex match did not normalize"),
                }
            }
        }
        None
    }

    fn normalize(&self, pattern: TextPattern, caps: &Captures) -> Option<NaiveDate> {
        match pattern {
            TextPattern::MonthDayYear => self.ymd(num(caps, 3)?, month_of(caps, 1)?, num(caps, 2)?),
            TextPattern::DayMonthYear => self.ymd(num(caps, 3)?, month_of(caps, 2)?, num(caps, 1)?),
            TextPattern::MonthYear => self.ymd(num(caps, 2)?, month_of(caps, 1)?, 1),
            TextPattern::Numeric => self.ymd(num(caps, 1)?, num(caps, 2)?, num(caps, 3)?),
            TextPattern::Year => self.ymd(num(caps, 1)?, 1, 1),
        }
    }

    /// Date-phrase recognition over the leading window of the text.
    ///
    /// All phrase matches are collected; the longest wins, earliest on ties.
    pub fn from_entities(&self, text: &str) -> Option<NaiveDate> {
        let window = leading_chars(text, self.entity_window_chars);
        let mut found: Vec<(usize, usize, Option<NaiveDate>)> = Vec::new();

        for caps in RE_ENT_DAY_MONTH.captures_iter(window) {
            let date = self.phrase(&caps, 3, month_of(&caps, 2), num(&caps, 1));
            found.push(span(&caps, date));
        }
        for caps in RE_ENT_MONTH_DAY.captures_iter(window) {
            let date = self.phrase(&caps, 3, month_of(&caps, 1), num(&caps, 2));
            found.push(span(&caps, date));
        }
        for caps in RE_ENT_SLASH.captures_iter(window) {
            // Month first unless that is impossible.
            let date = match (num::<u32>(&caps, 1), num::<u32>(&caps, 2)) {
                (Some(a), Some(b)) if a > 12 => self.phrase(&caps, 3, Some(b), Some(a)),
                (a, b) => self.phrase(&caps, 3, a, b),
            };
            found.push(span(&caps, date));
        }
        for caps in RE_ENT_MONTH_SHORT_YEAR.captures_iter(window) {
            let date = self.phrase(&caps, 2, month_of(&caps, 1), Some(1));
            found.push(span(&caps, date));
        }

        found
            .into_iter()
            .min_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)))
            .and_then(|(_, _, date)| date)
    }

    fn phrase(
        &self,
        caps: &Captures,
        year_group: usize,
        month: Option<u32>,
        day: Option<u32>,
    ) -> Option<NaiveDate> {
        let year = year_token(caps.get(year_group)?.as_str())?;
        self.ymd(year, month?, day?)
    }

    /// Fuzzy parsing of 4-word windows across the leading sentences.
    ///
    /// A window parses when it holds a month name and a year; a day number
    /// is optional.
    pub fn from_fuzzy(&self, text: &str) -> Option<NaiveDate> {
        for sentence in text.split('.').take(self.fuzzy_sentences) {
            let words: Vec<&str> = sentence.split_whitespace().collect();
            for i in 0..words.len().saturating_sub(2) {
                let end = (i + 4).min(words.len());
                if let Some(date) = self.parse_window(&words[i..end]) {
                    return Some(date);
                }
            }
        }
        None
    }

    fn parse_window(&self, words: &[&str]) -> Option<NaiveDate> {
        let mut month = None;
        let mut year = None;
        let mut day = None;

        for word in words {
            let token = word
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '\'')
                .trim_end_matches('\'')
                .to_lowercase();
            if token.is_empty() {
                continue;
            }
            if month.is_none() {
                if let Some(m) = fuzzy_month(&token) {
                    month = Some(m);
                    continue;
                }
            }
            if year.is_none() {
                if let Some(y) = fuzzy_year(&token) {
                    year = Some(y);
                    continue;
                }
            }
            if day.is_none() {
                let digits = token
                    .trim_end_matches("st")
                    .trim_end_matches("nd")
                    .trim_end_matches("rd")
                    .trim_end_matches("th");
                if (1..=2).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
                    day = digits.parse::<u32>().ok().filter(|d| (1..=31).contains(d));
                }
            }
        }

        self.ymd(year?, month?, day.unwrap_or(1))
    }

    /// Build a date, rejecting impossible days and out-of-range years.
    fn ymd(&self, year: i32, month: u32, day: u32) -> Option<NaiveDate> {
        if year < self.min_year || year > self.max_year {
            return None;
        }
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

#[derive(Debug, Clone, Copy)]
enum TextPattern {
    MonthDayYear,
    DayMonthYear,
    MonthYear,
    Numeric,
    Year,
}

impl TextPattern {
    const ALL: [TextPattern; 5] = [
        TextPattern::MonthDayYear,
        TextPattern::DayMonthYear,
        TextPattern::MonthYear,
        TextPattern::Numeric,
        TextPattern::Year,
    ];

    fn regex(self) -> &'static Regex {
        match self {
            TextPattern::MonthDayYear => &RE_MONTH_DAY_YEAR,
            TextPattern::DayMonthYear => &RE_DAY_MONTH_YEAR,
            TextPattern::MonthYear => &RE_MONTH_YEAR,
            TextPattern::Numeric => &RE_NUMERIC,
            TextPattern::Year => &RE_YEAR,
        }
    }

    fn confidence(self) -> f64 {
        match self {
            TextPattern::MonthDayYear | TextPattern::DayMonthYear | TextPattern::Numeric => 0.95,
            TextPattern::MonthYear => 0.85,
            TextPattern::Year => 0.6,
        }
    }
}

fn num<T: std::str::FromStr>(caps: &Captures, group: usize) -> Option<T> {
    caps.get(group)?.as_str().parse().ok()
}

fn month_of(caps: &Captures, group: usize) -> Option<u32> {
    month_number(caps.get(group)?.as_str())
}

fn span(caps: &Captures, date: Option<NaiveDate>) -> (usize, usize, Option<NaiveDate>) {
    caps.get(0)
        .map_or((0, 0, None), |m| (m.start(), m.len(), date))
}

/// Month number from a full or abbreviated English month name.
pub fn month_number(name: &str) -> Option<u32> {
    let lower = name.trim_end_matches('.').to_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(month)
}

const FULL_MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Only exact names or standard abbreviations count in free text, so that
/// words like "market" or "decided" are not read as months.
fn fuzzy_month(token: &str) -> Option<u32> {
    let token = token.trim_end_matches('.');
    let exact = FULL_MONTHS.contains(&token)
        || token == "sept"
        || (token.len() == 3 && FULL_MONTHS.iter().any(|m| m.starts_with(token)));
    if exact {
        month_number(token)
    } else {
        None
    }
}

fn fuzzy_year(token: &str) -> Option<i32> {
    if let Some(short) = token.strip_prefix('\'') {
        if short.len() == 2 && short.chars().all(|c| c.is_ascii_digit()) {
            return short.parse().ok().map(pivot_year);
        }
        return None;
    }
    if token.len() == 4 && token.chars().all(|c| c.is_ascii_digit()) {
        return token.parse().ok();
    }
    None
}

/// Four-digit year, or `'yy` expanded with the 69 pivot.
fn year_token(raw: &str) -> Option<i32> {
    match raw.strip_prefix('\'') {
        Some(short) => short.parse().ok().map(pivot_year),
        None if raw.len() == 2 => raw.parse().ok().map(pivot_year),
        None => raw.parse().ok(),
    }
}

pub fn pivot_year(two_digit: i32) -> i32 {
    if two_digit < 69 {
        2000 + two_digit
    } else {
        1900 + two_digit
    }
}

fn leading_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
