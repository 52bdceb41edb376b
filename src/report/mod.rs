//! RESULT lines: formatting, parsing and the append-only stats file.

use serde::Serialize;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{BenchError, Result};

pub const DEFAULT_OUTPUT: &str = "stats.txt";
pub const LINE_PREFIX: &str = "RESULT";

/// One accepted measurement.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ResultRecord {
    pub datetime: String,
    pub host: String,
    pub version: String,
    pub funcname: String,
    pub nthreads: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numahop: Option<u64>,
    pub areasize: u64,
    pub threadsize: u64,
    pub testsize: u64,
    pub repeats: u64,
    pub testvol: u64,
    pub testaccess: u64,
    pub time: f64,
    pub bandwidth: f64,
    pub rate: f64,
}

impl ResultRecord {
    /// `RESULT` followed by tab separated `key=value` pairs in fixed order.
    ///
    /// Floats use the shortest representation that parses back to the same
    /// value, so `parse(to_line())` is lossless.
    pub fn to_line(&self) -> String {
        let mut line = String::with_capacity(320);
        line.push_str(LINE_PREFIX);
        let mut field = |key: &str, value: &dyn std::fmt::Display| {
            // writing into a String cannot fail
            let _ = write!(line, "\t{key}={value}");
        };
        field("datetime", &self.datetime);
        field("host", &self.host);
        field("version", &self.version);
        field("funcname", &self.funcname);
        field("nthreads", &self.nthreads);
        if let Some(hop) = self.numahop {
            field("numahop", &hop);
        }
        field("areasize", &self.areasize);
        field("threadsize", &self.threadsize);
        field("testsize", &self.testsize);
        field("repeats", &self.repeats);
        field("testvol", &self.testvol);
        field("testaccess", &self.testaccess);
        field("time", &self.time);
        field("bandwidth", &self.bandwidth);
        field("rate", &self.rate);
        line
    }

    /// Reads a line written by [`to_line`](Self::to_line). Keys are split at
    /// the first `=`; unknown keys are ignored.
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).split('\t');
        if fields.next() != Some(LINE_PREFIX) {
            return Err(BenchError::Parse(format!("missing {LINE_PREFIX} prefix")));
        }

        let mut rec = ResultRecord {
            datetime: String::new(),
            host: String::new(),
            version: String::new(),
            funcname: String::new(),
            nthreads: 0,
            numahop: None,
            areasize: 0,
            threadsize: 0,
            testsize: 0,
            repeats: 0,
            testvol: 0,
            testaccess: 0,
            time: 0.0,
            bandwidth: 0.0,
            rate: 0.0,
        };
        let mut seen = 0usize;
        for field in fields {
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| BenchError::Parse(format!("field '{field}' has no '='")))?;
            let int = || {
                value
                    .parse::<u64>()
                    .map_err(|_| BenchError::Parse(format!("{key}={value} is not an integer")))
            };
            let float = || {
                value
                    .parse::<f64>()
                    .map_err(|_| BenchError::Parse(format!("{key}={value} is not a number")))
            };
            match key {
                "datetime" => rec.datetime = value.to_string(),
                "host" => rec.host = value.to_string(),
                "version" => rec.version = value.to_string(),
                "funcname" => rec.funcname = value.to_string(),
                "nthreads" => rec.nthreads = int()?,
                "numahop" => {
                    rec.numahop = Some(int()?);
                    continue;
                }
                "areasize" => rec.areasize = int()?,
                "threadsize" => rec.threadsize = int()?,
                "testsize" => rec.testsize = int()?,
                "repeats" => rec.repeats = int()?,
                "testvol" => rec.testvol = int()?,
                "testaccess" => rec.testaccess = int()?,
                "time" => rec.time = float()?,
                "bandwidth" => rec.bandwidth = float()?,
                "rate" => rec.rate = float()?,
                _ => continue,
            }
            seen += 1;
        }
        if seen < 14 {
            return Err(BenchError::Parse(format!("only {seen} of 14 required fields present")));
        }
        Ok(rec)
    }
}

/// Format of the stdout mirror. The stats file always holds RESULT lines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    /// One newline-terminated line for stdout.
    pub fn render(self, record: &ResultRecord) -> Result<String> {
        let mut line = match self {
            OutputFormat::Text => record.to_line(),
            OutputFormat::Json => {
                serde_json::to_string(record).map_err(|e| BenchError::Io(io::Error::other(e)))?
            }
        };
        line.push('\n');
        Ok(line)
    }
}

/// Appends RESULT lines to the stats file and mirrors them to stdout.
pub struct ResultWriter {
    path: PathBuf,
    file: File,
    format: OutputFormat,
    echo: bool,
}

impl ResultWriter {
    /// Opens `path` for appending, truncating it once.
    pub fn create(path: impl AsRef<Path>, format: OutputFormat) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.set_len(0)?;
        Ok(ResultWriter {
            path,
            file,
            format,
            echo: true,
        })
    }

    /// Stops mirroring to stdout.
    pub fn quiet(mut self) -> Self {
        self.echo = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one whole line with a single `write` so a killed run never
    /// leaves a torn record behind.
    pub fn write(&mut self, record: &ResultRecord) -> Result<()> {
        let mut line = record.to_line();
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;

        if self.echo {
            let mirrored = match self.format {
                OutputFormat::Text => line,
                format => format.render(record)?,
            };
            let mut out = io::stdout().lock();
            out.write_all(mirrored.as_bytes())?;
            out.flush()?;
        }
        Ok(())
    }
}
