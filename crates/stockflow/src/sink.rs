//! Durable trade sink: one CSV file per UTC day

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::SinkError;
use crate::event::{Side, TradeEvent};

pub const FILE_PREFIX: &str = "consumed_trades";
pub const HEADER: [&str; 5] = ["symbol", "side", "quantity", "price", "timestamp"];

/// Persists consumed trades. `append` returns only once the record is durable.
pub trait Sink: Send {
    fn append(&mut self, event: &TradeEvent) -> Result<(), SinkError>;
}

#[derive(Serialize)]
struct CsvRow<'a> {
    symbol: &'a str,
    side: Side,
    quantity: u32,
    price: f64,
    timestamp: String,
}

impl<'a> From<&'a TradeEvent> for CsvRow<'a> {
    fn from(event: &'a TradeEvent) -> Self {
        Self {
            symbol: event.symbol(),
            side: event.side(),
            quantity: event.quantity(),
            price: event.price(),
            timestamp: event
                .timestamp()
                .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }
}

/// Appends to `consumed_trades_YYYY-MM-DD.csv`, dated by processing time
pub struct DailyCsvSink {
    base_path: PathBuf,
    current: Option<CurrentFile>,
}

struct CurrentFile {
    date: NaiveDate,
    path: PathBuf,
    writer: csv::Writer<File>,
    records: u64,
}

impl DailyCsvSink {
    /// Open the sink, creating `base_path` if needed
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        info!(path = %base_path.display(), "CSV sink ready");
        Ok(Self {
            base_path,
            current: None,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.base_path
            .join(format!("{}_{}.csv", FILE_PREFIX, date.format("%Y-%m-%d")))
    }

    /// Append `event` to the file for `now`'s UTC date
    pub fn append_at(&mut self, event: &TradeEvent, now: DateTime<Utc>) -> Result<(), SinkError> {
        let date = now.date_naive();
        let file = match self.current.take() {
            Some(file) if file.date == date => file,
            previous => {
                if let Some(previous) = previous {
                    debug!(
                        path = %previous.path.display(),
                        records = previous.records,
                        "Closing daily file"
                    );
                }
                self.open_file(date)?
            }
        };

        // On failure the handle is dropped and the file reopened on the next append
        let file = Self::write_row(file, event)?;
        self.current = Some(file);
        Ok(())
    }

    fn write_row(mut file: CurrentFile, event: &TradeEvent) -> Result<CurrentFile, SinkError> {
        file.writer.serialize(CsvRow::from(event))?;
        file.writer.flush()?;
        file.writer.get_ref().sync_data()?;
        file.records += 1;
        Ok(file)
    }

    fn open_file(&self, date: NaiveDate) -> Result<CurrentFile, SinkError> {
        let path = self.path_for(date);
        let handle = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_header = handle.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(handle);
        if needs_header {
            writer.write_record(HEADER)?;
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }

        info!(path = %path.display(), new_file = needs_header, "Opened daily trade file");
        Ok(CurrentFile {
            date,
            path,
            writer,
            records: 0,
        })
    }
}

impl Sink for DailyCsvSink {
    fn append(&mut self, event: &TradeEvent) -> Result<(), SinkError> {
        self.append_at(event, Utc::now())
    }
}
