use crate::error::{EngineError, Result};
use serde::Deserialize;
use std::io::Read;

/// One scanner read: the decoded QR payload and the device that read it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Scan {
    pub token: String,
    pub scanner: String,
}

/// Reads scanner logs (`token,scanner`) from a CSV source.
pub struct ScanReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> ScanReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    pub fn scans(self) -> impl Iterator<Item = Result<Scan>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(EngineError::from))
    }
}
