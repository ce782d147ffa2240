use std::path::Path;

use serde::Deserialize;

use crate::bet::Bet;
use crate::Result;

#[derive(Debug, Deserialize)]
struct InputRow {
    first_name: String,
    last_name: String,
    document: String,
    birthdate: String,
    number: String,
}

/// Reads an agency's bets from a header-less CSV file
/// (`first_name,last_name,document,birthdate,number`), in file order.
pub fn load_agency_bets(path: impl AsRef<Path>, agency: u8) -> Result<Vec<Bet>> {
    let mut rows = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path.as_ref())?;
    let mut bets = Vec::new();
    for row in rows.deserialize::<InputRow>() {
        let row = row?;
        bets.push(Bet::new(
            agency,
            row.first_name,
            row.last_name,
            row.document,
            &row.birthdate,
            row.number,
        )?);
    }
    Ok(bets)
}
