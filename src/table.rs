//! Semicolon-delimited, Latin-1 encoded tables.
//!
//! Every input and output of the pipeline shares this format. Fields are read
//! as raw bytes and decoded one byte per character, so a mis-declared
//! encoding never fails a read; it only shows up as odd characters.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder, WriterBuilder};

use crate::error::{PipelineError, Result};

pub const DELIMITER: u8 = b';';

pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

pub fn encode_latin1(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

pub struct TableReader<R> {
    path: PathBuf,
    reader: csv::Reader<R>,
    columns: Vec<String>,
}

impl TableReader<File> {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::InputNotFound {
                path: path.to_path_buf(),
            });
        }
        let file = File::open(path).map_err(|err| PipelineError::io(path, err))?;
        Self::from_reader(path, file)
    }
}

impl<R: Read> TableReader<R> {
    pub fn from_reader(path: impl Into<PathBuf>, source: R) -> Result<Self> {
        let path = path.into();
        let mut reader = ReaderBuilder::new()
            .delimiter(DELIMITER)
            .flexible(true)
            .from_reader(source);
        let columns = reader
            .byte_headers()
            .map_err(|err| PipelineError::csv(&path, err))?
            .iter()
            .map(|name| decode_latin1(name).trim().to_string())
            .collect();

        Ok(Self {
            path,
            reader,
            columns,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn require(&self, name: &str) -> Result<usize> {
        self.column(name)
            .ok_or_else(|| PipelineError::schema(&self.path, name))
    }

    /// Reads the next row into `record`. Returns `false` at end of input.
    pub fn next_row(&mut self, record: &mut ByteRecord) -> Result<bool> {
        self.reader
            .read_byte_record(record)
            .map_err(|err| PipelineError::csv(&self.path, err))
    }
}

/// The field decoded verbatim; absent trailing fields read as empty.
pub fn raw_field(record: &ByteRecord, index: usize) -> String {
    record.get(index).map(decode_latin1).unwrap_or_default()
}

/// The trimmed field, or `None` when it is empty.
pub fn field(record: &ByteRecord, index: usize) -> Option<String> {
    let value = raw_field(record, index);
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Numeric field. Accepts a decimal comma; unparsable text is a missing value.
pub fn number_field(record: &ByteRecord, index: usize) -> Option<f64> {
    field(record, index)?
        .replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

pub struct TableWriter<W: Write> {
    path: PathBuf,
    writer: csv::Writer<W>,
}

impl TableWriter<File> {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
        }
        let file = File::create(path).map_err(|err| PipelineError::io(path, err))?;
        Ok(Self::from_writer(path, file))
    }
}

impl<W: Write> TableWriter<W> {
    pub fn from_writer(path: impl Into<PathBuf>, sink: W) -> Self {
        Self {
            path: path.into(),
            writer: WriterBuilder::new().delimiter(DELIMITER).from_writer(sink),
        }
    }

    pub fn write_row<S: AsRef<str>>(&mut self, fields: &[S]) -> Result<()> {
        let encoded: Vec<Vec<u8>> = fields
            .iter()
            .map(|field| encode_latin1(field.as_ref()))
            .collect();
        self.writer
            .write_record(&encoded)
            .map_err(|err| PipelineError::csv(&self.path, err))
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer
            .flush()
            .map_err(|err| PipelineError::io(&self.path, err))?;
        let path = self.path;
        self.writer
            .into_inner()
            .map_err(|err| PipelineError::io(&path, err.into_error()))
    }
}
