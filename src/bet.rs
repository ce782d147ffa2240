use time::macros::format_description;
use time::Date;

use crate::{Error, Result};

/// Number drawn by the default lottery rule.
pub const WINNING_NUMBER: u32 = 7574;

/// One wagering record. `agency` always comes from the frame header of the
/// connection that delivered the record, never from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: u8,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: Date,
    pub number: String,
}

impl Bet {
    pub fn new(
        agency: u8,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        document: impl Into<String>,
        birthdate: &str,
        number: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            agency,
            first_name: first_name.into(),
            last_name: last_name.into(),
            document: document.into(),
            birthdate: parse_birthdate(birthdate)?,
            number: number.into(),
        })
    }

    /// Birthdate rendered back as `YYYY-MM-DD`. Fails for years that do not
    /// fit four digits.
    pub fn birthdate_text(&self) -> Result<String> {
        format_birthdate(self.birthdate)
    }
}

/// Parses a `YYYY-MM-DD` birthdate. Only text that formats back to itself is
/// accepted, so whatever is stored can be read again.
pub(crate) fn parse_birthdate(text: &str) -> Result<Date> {
    let date = Date::parse(text, format_description!("[year]-[month]-[day]"))
        .map_err(|_| Error::Malformed("invalid birthdate"))?;
    if format_birthdate(date)? != text {
        return Err(Error::Malformed("birthdate is not in YYYY-MM-DD form"));
    }
    Ok(date)
}

pub(crate) fn format_birthdate(date: Date) -> Result<String> {
    if !(0..=9999).contains(&date.year()) {
        return Err(Error::Malformed("birthdate year outside 0000-9999"));
    }
    date.format(format_description!("[year]-[month]-[day]"))
        .map_err(|_| Error::Malformed("invalid birthdate"))
}

/// Lottery rule deciding whether a stored bet has won.
pub trait WinningRule: Send + Sync {
    fn has_won(&self, bet: &Bet) -> bool;
}

/// Default rule: the wagered number equals a fixed drawn number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinningNumber(pub u32);

impl Default for WinningNumber {
    fn default() -> Self {
        Self(WINNING_NUMBER)
    }
}

impl WinningRule for WinningNumber {
    fn has_won(&self, bet: &Bet) -> bool {
        bet.number.trim().parse::<u32>().map_or(false, |n| n == self.0)
    }
}
