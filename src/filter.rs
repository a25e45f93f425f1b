//! Time windows and search constraints applied to record fetches.

use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use chrono::Datelike;
use chrono::Months;
use chrono::NaiveDate;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// From the same day N months ago up to now.
    LastMonths(u32),
    LastYears(u32),
    /// A single calendar month.
    Month { year: i32, month: u32 },
    /// A single calendar year.
    Year(i32),
    AllTime,
}

/// Inclusive date range. `None` means unbounded on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateBounds {
    pub from: Option<NaiveDate>,
    pub to:   Option<NaiveDate>,
}

impl DateBounds {
    /// A range no date falls into.
    pub const EMPTY: DateBounds = DateBounds {
        from: Some(NaiveDate::MAX),
        to:   Some(NaiveDate::MIN),
    };

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
    }
}

impl TimeWindow {
    pub const ONE_MONTH: TimeWindow = TimeWindow::LastMonths(1);
    pub const THREE_MONTHS: TimeWindow = TimeWindow::LastMonths(3);
    pub const SIX_MONTHS: TimeWindow = TimeWindow::LastMonths(6);
    pub const ONE_YEAR: TimeWindow = TimeWindow::LastYears(1);

    /// The windows offered by the dashboard, in display order.
    pub const PRESETS: [TimeWindow; 5] = [
        Self::ONE_MONTH,
        Self::THREE_MONTHS,
        Self::SIX_MONTHS,
        Self::ONE_YEAR,
        Self::AllTime,
    ];

    /// Resolve the window against `today`. Month arithmetic clamps to the end of shorter months, i.e. one month
    /// before March 31st is the last day of February.
    pub fn bounds(&self, today: NaiveDate) -> DateBounds {
        match *self {
            Self::LastMonths(n) => DateBounds {
                from: Some(today.checked_sub_months(Months::new(n)).unwrap_or(NaiveDate::MIN)),
                to:   None,
            },
            Self::LastYears(n) => DateBounds {
                from: Some(
                    today
                        .checked_sub_months(Months::new(n.saturating_mul(12)))
                        .unwrap_or(NaiveDate::MIN),
                ),
                to:   None,
            },
            Self::Month { year, month } => match NaiveDate::from_ymd_opt(year, month, 1) {
                Some(first) => DateBounds {
                    from: Some(first),
                    to:   first.checked_add_months(Months::new(1)).and_then(|d| d.pred_opt()),
                },
                None => DateBounds::EMPTY,
            },
            Self::Year(year) => match (NaiveDate::from_ymd_opt(year, 1, 1), NaiveDate::from_ymd_opt(year, 12, 31)) {
                (Some(from), Some(to)) => DateBounds {
                    from: Some(from),
                    to:   Some(to),
                },
                _ => DateBounds::EMPTY,
            },
            Self::AllTime => DateBounds::default(),
        }
    }

    pub fn is_all_time(&self) -> bool {
        matches!(self, Self::AllTime)
    }

    /// Reject windows no date can be computed for.
    pub fn validate(self) -> Result<Self, Error> {
        match self {
            Self::LastMonths(0) | Self::LastYears(0) => Err(Error::Filter("window length must be positive".into())),
            Self::Month { month, .. } if !(1..=12).contains(&month) => {
                Err(Error::Filter(format!("no such month: {month}")))
            }
            Self::Month { year, .. } | Self::Year(year) if NaiveDate::from_ymd_opt(year, 1, 1).is_none() => {
                Err(Error::Filter(format!("year {year} is out of range")))
            }
            _ => Ok(self),
        }
    }
}

impl Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastMonths(n) => write!(f, "{n}m"),
            Self::LastYears(n) => write!(f, "{n}y"),
            Self::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Self::Year(year) => write!(f, "{year:04}"),
            Self::AllTime => f.write_str("all"),
        }
    }
}

impl FromStr for TimeWindow {
    type Err = Error;

    /// Accepts `Nm`, `Ny`, `all`, `YYYY-MM` and `YYYY`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || Error::Filter(format!("unrecognized time window '{s}'"));

        let window = if s.eq_ignore_ascii_case("all") {
            Self::AllTime
        }
        else if let Some(n) = s.strip_suffix('m') {
            Self::LastMonths(n.parse().map_err(|_| bad())?)
        }
        else if let Some(n) = s.strip_suffix('y') {
            Self::LastYears(n.parse().map_err(|_| bad())?)
        }
        else if let Some((year, month)) = s.split_once('-') {
            Self::Month {
                year:  year.parse().map_err(|_| bad())?,
                month: month.parse().map_err(|_| bad())?,
            }
        }
        else {
            Self::Year(s.parse().map_err(|_| bad())?)
        };

        window.validate()
    }
}

/// The active constraint of a view. Two descriptors are equal only when every constraint matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterDescriptor {
    window: TimeWindow,
    search: Option<String>,
}

impl FilterDescriptor {
    pub fn new(window: TimeWindow) -> Self {
        Self { window, search: None }
    }

    pub fn all_time() -> Self {
        Self::new(TimeWindow::AllTime)
    }

    /// Search text is trimmed and lowercased; blank text clears the search.
    pub fn with_search<S: AsRef<str>>(mut self, text: S) -> Self {
        let text = text.as_ref().trim().to_lowercase();
        self.search = if text.is_empty() { None } else { Some(text) };
        self
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn search(&self) -> Option<&str> {
        self.search.as_deref()
    }

    pub fn bounds(&self, today: NaiveDate) -> DateBounds {
        self.window.bounds(today)
    }
}

impl Default for FilterDescriptor {
    fn default() -> Self {
        Self::new(TimeWindow::ONE_MONTH)
    }
}

impl From<TimeWindow> for FilterDescriptor {
    fn from(window: TimeWindow) -> Self {
        Self::new(window)
    }
}

impl Display for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.search {
            Some(ref q) => write!(f, "{}?q={q}", self.window),
            None => write!(f, "{}", self.window),
        }
    }
}

/// Source of "today" for relative windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Clock {
    #[default]
    System,
    Fixed(NaiveDate),
}

impl Clock {
    pub fn today(&self) -> NaiveDate {
        match self {
            Self::System => chrono::Local::now().date_naive(),
            Self::Fixed(date) => *date,
        }
    }
}

/// `DD/MM/YYYY`, the way dates are shown to the user and therefore searchable.
pub fn display_date(date: NaiveDate) -> String {
    format!("{:02}/{:02}/{:04}", date.day(), date.month(), date.year())
}
