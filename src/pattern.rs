//! Cyclic work/rest pattern generator.
//!
//! A pattern is `work_days` on followed by `rest_days` off, repeating. The
//! anchor day (1-based, within the cycle) says where in the cycle the fill
//! starts; the fill itself can begin anywhere in the month, leaving earlier
//! days untouched.

use chrono::NaiveDate;

use crate::states::PlanState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternCode {
    FourByFour,
    FiveByTwo,
    SixByOne,
    SevenBySeven,
}

impl PatternCode {
    pub fn as_str(self) -> &'static str {
        match self {
            PatternCode::FourByFour => "4x4",
            PatternCode::FiveByTwo => "5x2",
            PatternCode::SixByOne => "6x1",
            PatternCode::SevenBySeven => "7x7",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "4x4" => Some(PatternCode::FourByFour),
            "5x2" => Some(PatternCode::FiveByTwo),
            "6x1" => Some(PatternCode::SixByOne),
            "7x7" => Some(PatternCode::SevenBySeven),
            _ => None,
        }
    }

    pub fn work_days(self) -> u32 {
        match self {
            PatternCode::FourByFour => 4,
            PatternCode::FiveByTwo => 5,
            PatternCode::SixByOne => 6,
            PatternCode::SevenBySeven => 7,
        }
    }

    pub fn rest_days(self) -> u32 {
        match self {
            PatternCode::FourByFour => 4,
            PatternCode::FiveByTwo => 2,
            PatternCode::SixByOne => 1,
            PatternCode::SevenBySeven => 7,
        }
    }

    pub fn cycle_len(self) -> u32 {
        self.work_days() + self.rest_days()
    }
}

/// The legacy planner silently substituted 4x4 for anything it did not
/// recognize. Strict mode turns that into a caller error instead.
pub fn parse_code(raw: &str, strict: bool, default: PatternCode) -> Result<PatternCode, String> {
    match PatternCode::parse(raw) {
        Some(code) => Ok(code),
        None if strict => Err(format!("unknown pattern code: {}", raw)),
        None => Ok(default),
    }
}

/// State for the day at `offset` zero-based days from the fill start.
pub fn day_state(code: PatternCode, anchor_day: u32, offset: u32) -> PlanState {
    let cycle = code.cycle_len();
    let pos = (offset + anchor_day - 1) % cycle;
    if pos < code.work_days() {
        PlanState::Scheduled
    } else {
        PlanState::Off
    }
}

/// Fill states for days `from_day..=days_in_month` (1-based). Days before
/// `from_day` are not in the result; the caller leaves them untouched.
pub fn fill_from(
    code: PatternCode,
    anchor_day: u32,
    from_day: u32,
    days_in_month: u32,
) -> Vec<(u32, PlanState)> {
    (from_day..=days_in_month)
        .map(|day| (day, day_state(code, anchor_day, day - from_day)))
        .collect()
}

pub fn anchor_in_range(code: PatternCode, anchor_day: u32) -> bool {
    (1..=code.cycle_len()).contains(&anchor_day)
}

pub fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some(next.signed_duration_since(first).num_days() as u32)
}
