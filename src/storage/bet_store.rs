use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{error, warn};
use serde::{Deserialize, Serialize};

use super::lock;
use crate::bet::{format_birthdate, parse_birthdate, Bet};
use crate::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
struct StoredBet {
    agency: u8,
    first_name: String,
    last_name: String,
    document: String,
    birthdate: String,
    number: String,
}

impl TryFrom<&Bet> for StoredBet {
    type Error = Error;

    fn try_from(bet: &Bet) -> Result<Self> {
        Ok(Self {
            agency: bet.agency,
            first_name: bet.first_name.clone(),
            last_name: bet.last_name.clone(),
            document: bet.document.clone(),
            birthdate: format_birthdate(bet.birthdate)?,
            number: bet.number.clone(),
        })
    }
}

impl TryFrom<StoredBet> for Bet {
    type Error = Error;

    fn try_from(row: StoredBet) -> Result<Self> {
        Ok(Bet {
            agency: row.agency,
            first_name: row.first_name,
            last_name: row.last_name,
            document: row.document,
            birthdate: parse_birthdate(&row.birthdate)?,
            number: row.number,
        })
    }
}

/// Append-only bet log backed by a header-less CSV file
/// (`agency,first_name,last_name,document,birthdate,number`).
///
/// Appends and full loads share one mutex, so a load never sees half of an
/// append. The data file is also `flock`ed for the life of the store so a
/// second process cannot open it as a writer.
pub struct BetStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl BetStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        if !lock::try_lock(&file)? {
            return Err(Error::StoreLocked(path));
        }
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `bets` as one write. On failure the file is cut back to its
    /// previous length, so earlier records stay readable.
    pub fn append(&self, bets: &[Bet]) -> Result<usize> {
        let mut rows = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for bet in bets {
            rows.serialize(StoredBet::try_from(bet)?)?;
        }
        let bytes = rows.into_inner().map_err(|err| Error::Io(err.into_error()))?;

        let mut file = self.lock();
        let prior_len = file.metadata()?.len();
        if let Err(err) = file.write_all(&bytes).and_then(|_| file.flush()) {
            error!(
                "action: store_bets | result: fail | path: {} | error: {}",
                self.path.display(),
                err
            );
            if let Err(truncate_err) = file.set_len(prior_len) {
                warn!(
                    "action: store_rollback | result: fail | path: {} | error: {}",
                    self.path.display(),
                    truncate_err
                );
            }
            return Err(Error::Io(err));
        }
        Ok(bets.len())
    }

    /// Every record appended so far, in append order.
    pub fn load_all(&self) -> Result<Vec<Bet>> {
        let _guard = self.lock();
        let reader = File::open(&self.path)?;
        let mut rows = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(reader);
        let mut bets = Vec::new();
        for row in rows.deserialize::<StoredBet>() {
            bets.push(Bet::try_from(row?)?);
        }
        Ok(bets)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.load_all()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // Poisoning is ignored: `append` never leaves a partial record.
    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tempfile::tempdir;

    fn bet(agency: u8, document: &str) -> Bet {
        Bet::new(agency, "Ana, Maria", "O\"Brien", document, "1990-12-31", "7574").expect("bet")
    }

    #[test]
    fn append_then_load_preserves_order_and_fields() {
        let dir = tempdir().expect("tempdir");
        let store = BetStore::open(dir.path().join("bets.csv")).expect("open");

        store.append(&[bet(1, "1"), bet(1, "2")]).expect("append");
        store.append(&[bet(2, "3")]).expect("append");

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded, vec![bet(1, "1"), bet(1, "2"), bet(2, "3")]);
    }

    #[test]
    fn unreadable_birthdate_is_refused_before_writing() {
        let dir = tempdir().expect("tempdir");
        let store = BetStore::open(dir.path().join("bets.csv")).expect("open");
        store.append(&[bet(1, "1")]).expect("append");

        let mut odd = bet(1, "2");
        odd.birthdate = time::Date::from_calendar_date(-5, time::Month::January, 1).expect("date");
        assert!(matches!(store.append(&[bet(1, "3"), odd]), Err(Error::Malformed(_))));

        assert_eq!(store.load_all().expect("load"), vec![bet(1, "1")]);
    }

    #[test]
    fn empty_store_loads_nothing() {
        let dir = tempdir().expect("tempdir");
        let store = BetStore::open(dir.path().join("nested").join("bets.csv")).expect("open");
        assert!(store.is_empty().expect("is_empty"));
    }

    #[test]
    fn second_open_is_refused_while_locked() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bets.csv");
        let first = BetStore::open(&path).expect("open");
        assert!(matches!(BetStore::open(&path), Err(Error::StoreLocked(_))));
        drop(first);
        BetStore::open(&path).expect("reopen after release");
    }

    #[test]
    fn reopen_sees_previous_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("bets.csv");
        {
            let store = BetStore::open(&path).expect("open");
            store.append(&[bet(4, "10")]).expect("append");
        }
        let store = BetStore::open(&path).expect("reopen");
        assert_eq!(store.load_all().expect("load"), vec![bet(4, "10")]);
    }

    #[test]
    fn concurrent_appends_never_interleave() {
        const WRITERS: u8 = 8;
        const BATCHES: usize = 25;
        const BATCH_LEN: usize = 10;

        let dir = tempdir().expect("tempdir");
        let store = Arc::new(BetStore::open(dir.path().join("bets.csv")).expect("open"));

        let handles: Vec<_> = (1..=WRITERS)
            .map(|agency| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for batch in 0..BATCHES {
                        let bets: Vec<Bet> = (0..BATCH_LEN)
                            .map(|i| bet(agency, &format!("{agency}-{batch}-{i}")))
                            .collect();
                        store.append(&bets).expect("append");
                        if batch % 5 == 0 {
                            store.load_all().expect("load during appends");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let loaded = store.load_all().expect("load");
        assert_eq!(loaded.len(), WRITERS as usize * BATCHES * BATCH_LEN);
        for agency in 1..=WRITERS {
            let docs: Vec<&str> = loaded
                .iter()
                .filter(|b| b.agency == agency)
                .map(|b| b.document.as_str())
                .collect();
            assert_eq!(docs.len(), BATCHES * BATCH_LEN);
            // Batches from one writer land whole and in submission order.
            for (idx, doc) in docs.iter().enumerate() {
                let expected = format!("{agency}-{}-{}", idx / BATCH_LEN, idx % BATCH_LEN);
                assert_eq!(*doc, expected);
            }
        }
    }
}
