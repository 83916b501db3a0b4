//! Date windows sent to the billing API.

use chrono::{Datelike, Days, Months, NaiveDate};

use crate::error::Error;

const API_DATE_FORMAT: &str = "%Y-%m-%d";

/// Half-open `[start, end)` range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateRange {
    /// Cost Explorer rejects windows where `start` is not before `end`, so an
    /// empty or reversed range is reported as a fetch failure.
    pub(crate) fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if start >= end {
            return Err(Error::Fetch(format!(
                "computed date range is empty or reversed: {start}..{end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The single day `today`.
    pub(crate) fn today(today: NaiveDate) -> Result<Self, Error> {
        let tomorrow = today
            .checked_add_days(Days::new(1))
            .ok_or_else(|| Error::Fetch(format!("no day after {today}")))?;
        Self::new(today, tomorrow)
    }

    /// From the first of the month up to, but not including, `today`.
    ///
    /// On the first of a month that window is empty, so the whole previous
    /// month is returned instead.
    pub(crate) fn month_to_date(today: NaiveDate) -> Result<Self, Error> {
        let first_of_month = today
            .checked_sub_days(Days::new(u64::from(today.day0())))
            .ok_or_else(|| Error::Fetch(format!("no start of month for {today}")))?;

        if first_of_month < today {
            return Self::new(first_of_month, today);
        }

        let first_of_previous_month = first_of_month
            .checked_sub_months(Months::new(1))
            .ok_or_else(|| Error::Fetch(format!("no month before {first_of_month}")))?;
        Self::new(first_of_previous_month, first_of_month)
    }

    pub(crate) fn start(&self) -> NaiveDate {
        self.start
    }

    pub(crate) fn end(&self) -> NaiveDate {
        self.end
    }

    pub(crate) fn start_param(&self) -> String {
        self.start.format(API_DATE_FORMAT).to_string()
    }

    pub(crate) fn end_param(&self) -> String {
        self.end.format(API_DATE_FORMAT).to_string()
    }
}

/// Which window a run reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ReportPeriod {
    #[default]
    MonthToDate,
    Today,
}

impl ReportPeriod {
    pub(crate) fn range_for(self, today: NaiveDate) -> Result<DateRange, Error> {
        match self {
            ReportPeriod::MonthToDate => DateRange::month_to_date(today),
            ReportPeriod::Today => DateRange::today(today),
        }
    }
}

impl std::str::FromStr for ReportPeriod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "month-to-date" | "month_to_date" | "monthly" => Ok(ReportPeriod::MonthToDate),
            "today" | "daily" => Ok(ReportPeriod::Today),
            other => Err(Error::Config(format!("unknown billing period: {other}"))),
        }
    }
}

impl std::fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportPeriod::MonthToDate => write!(f, "month-to-date"),
            ReportPeriod::Today => write!(f, "today"),
        }
    }
}
