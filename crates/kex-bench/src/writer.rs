//! Per-(configuration, RTT label) CSV output.
//!
//! Each row is `loss_rate,sample_1,sample_2,...`. Rows go to a `.partial`
//! file that is renamed into place once the last loss rate is written, so a
//! file under its final name always holds a complete table.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

const PARTIAL_SUFFIX: &str = ".partial";

/// `<configuration>_<rtt_label>ms.csv`
pub fn output_file_name(configuration: &str, rtt_label: &str) -> String {
    format!("{configuration}_{rtt_label}ms.csv")
}

/// Formats one CSV row: the loss rate followed by every sample.
pub fn format_row(loss_rate: f64, samples: &[f64]) -> String {
    let mut row = loss_rate.to_string();
    for sample in samples {
        row.push(',');
        row.push_str(&sample.to_string());
    }
    row
}

/// A finished output table.
#[derive(Debug, Clone, Serialize)]
pub struct ProducedFile {
    pub path: PathBuf,
    pub configuration: String,
    pub rtt_label: String,
    pub rows: usize,
}

/// Creates output files under one directory.
#[derive(Debug, Clone)]
pub struct ResultWriter {
    dir: PathBuf,
}

impl ResultWriter {
    /// Creates `dir` if needed.
    pub fn new(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn final_path(&self, configuration: &str, rtt_label: &str) -> PathBuf {
        self.dir.join(output_file_name(configuration, rtt_label))
    }

    /// Starts a fresh table, truncating any earlier partial file.
    pub fn open(&self, configuration: &str, rtt_label: &str) -> io::Result<OutputFile> {
        let path = self.final_path(configuration, rtt_label);
        let partial = partial_path(&path);
        let file = File::create(&partial)?;
        tracing::info!(path = %partial.display(), "output file opened");
        Ok(OutputFile {
            path,
            partial,
            out: BufWriter::new(file),
            configuration: configuration.to_string(),
            rtt_label: rtt_label.to_string(),
            rows: 0,
            last_loss: None,
        })
    }

    /// Row count of a finished table, or `None` if it does not exist.
    pub fn completed_rows(&self, configuration: &str, rtt_label: &str) -> io::Result<Option<usize>> {
        let path = self.final_path(configuration, rtt_label);
        match File::open(&path) {
            Ok(file) => count_rows(file).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn count_rows(file: File) -> io::Result<usize> {
    let mut rows = 0;
    for line in BufReader::new(file).lines() {
        if !line?.trim().is_empty() {
            rows += 1;
        }
    }
    Ok(rows)
}

/// An open table being filled in ascending loss-rate order.
pub struct OutputFile {
    path: PathBuf,
    partial: PathBuf,
    out: BufWriter<File>,
    configuration: String,
    rtt_label: String,
    rows: usize,
    last_loss: Option<f64>,
}

impl OutputFile {
    /// Path the table is currently written to.
    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Appends and flushes one row. Loss rates must strictly increase.
    pub fn append_row(&mut self, loss_rate: f64, samples: &[f64]) -> io::Result<()> {
        if let Some(last) = self.last_loss {
            if loss_rate <= last {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("loss rate {loss_rate} written after {last}"),
                ));
            }
        }
        writeln!(self.out, "{}", format_row(loss_rate, samples))?;
        self.out.flush()?;
        self.rows += 1;
        self.last_loss = Some(loss_rate);
        Ok(())
    }

    /// Syncs the table and moves it to its final name.
    pub fn finish(self) -> io::Result<ProducedFile> {
        let file = self.out.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.partial, &self.path)?;
        tracing::info!(path = %self.path.display(), rows = self.rows, "output file complete");
        Ok(ProducedFile {
            path: self.path,
            configuration: self.configuration,
            rtt_label: self.rtt_label,
            rows: self.rows,
        })
    }
}
