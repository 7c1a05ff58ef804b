//! # Heritability Estimation Backends
//!
//! SNP heritability is estimated by an external program (GCTA GREML or BOLT-LMM
//! REML). Programs are launched directly with an argument vector, never through
//! a shell. Each backend writes a report and the estimate is read back from a
//! single marker line of that report.
//!
//! Every request carries its own scratch directory, so concurrent jackknife
//! blocks never share intermediate files.

pub mod bolt;
pub mod gcta;

pub use bolt::Bolt;
pub use gcta::Gcta;

use crate::data::PersonId;
use log::debug;
use std::ffi::OsString;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeritabilityError {
    #[error("I/O error while running {tool}: {source}")]
    Io {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    ToolFailed {
        tool: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Could not find heritability marker '{marker}' in logfile: {}", path.display())]
    MarkerNotFound { marker: &'static str, path: PathBuf },

    #[error("Could not parse a heritability value from line '{line}'.")]
    Parse { line: String },
}

/// What a single estimate should be computed on.
#[derive(Debug, Clone, Copy)]
pub struct HeritabilityRequest<'a> {
    /// Private directory for this request's intermediate files.
    pub scratch_dir: &'a Path,
    /// Persons left out of the estimate (empty for the full sample).
    pub excluded: &'a [PersonId],
    /// Human-readable tag used in log lines.
    pub label: &'a str,
}

pub trait HeritabilityEstimator: Send + Sync {
    fn name(&self) -> &'static str;

    fn estimate(&self, request: &HeritabilityRequest<'_>) -> Result<f64, HeritabilityError>;
}

/// The report line an estimate is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerLine {
    /// `V(G)/Vp<TAB>estimate<TAB>se` in a GCTA `.hsq`-style log.
    Gcta,
    /// `h2g (1,1): estimate (se)` in BOLT-LMM output.
    Bolt,
}

impl MarkerLine {
    pub fn marker(self) -> &'static str {
        match self {
            MarkerLine::Gcta => "V(G)/Vp",
            MarkerLine::Bolt => "h2g (1,1):",
        }
    }

    fn value_field(self, line: &str) -> Option<&str> {
        match self {
            MarkerLine::Gcta => line.split('\t').nth(1),
            MarkerLine::Bolt => line
                .split(':')
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next()),
        }
    }

    /// Parses the first line carrying the marker. `None` when no line does.
    pub fn find_value(self, report: &str) -> Option<Result<f64, HeritabilityError>> {
        let line = report.lines().find(|line| line.contains(self.marker()))?;
        let parsed = self
            .value_field(line)
            .and_then(|field| field.trim().parse::<f64>().ok())
            .ok_or_else(|| HeritabilityError::Parse {
                line: line.to_string(),
            });
        Some(parsed)
    }

    pub fn read_from(self, tool: &'static str, path: &Path) -> Result<f64, HeritabilityError> {
        let report =
            fs::read_to_string(path).map_err(|source| HeritabilityError::Io { tool, source })?;
        let value = self
            .find_value(&report)
            .ok_or_else(|| HeritabilityError::MarkerNotFound {
                marker: self.marker(),
                path: path.to_path_buf(),
            })??;
        debug!("Estimated {tool} heritability of the trait is {value}");
        Ok(value)
    }
}

/// Writes a `FID IID` per line removal list.
pub fn write_removal_file(path: &Path, excluded: &[PersonId]) -> io::Result<()> {
    let mut writer = BufWriter::new(fs::File::create(path)?);
    for person in excluded {
        writeln!(writer, "{} {}", person.fid, person.iid)?;
    }
    writer.flush()
}

/// Where a tool's standard output should go.
pub(crate) enum Capture<'a> {
    /// Logged at debug level and discarded.
    Log,
    /// Written to the given file.
    File(&'a Path),
}

pub(crate) fn run_tool(
    tool: &'static str,
    program: &Path,
    args: &[OsString],
    capture: Capture<'_>,
) -> Result<(), HeritabilityError> {
    let rendered: Vec<String> = args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    debug!("Running: {} {}", program.display(), rendered.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|source| HeritabilityError::Io { tool, source })?;

    match capture {
        Capture::Log => debug!("{tool} output:\n{}", String::from_utf8_lossy(&output.stdout)),
        Capture::File(path) => {
            fs::write(path, &output.stdout).map_err(|source| HeritabilityError::Io { tool, source })?
        }
    }

    if !output.status.success() {
        return Err(HeritabilityError::ToolFailed {
            tool,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// `prefix` with `suffix` appended verbatim, for files like `<prefix>.log`.
pub(crate) fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut raw = prefix.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

pub(crate) fn flag_value(flag: &str, value: impl AsRef<std::ffi::OsStr>) -> OsString {
    let mut joined = OsString::from(flag);
    joined.push(value.as_ref());
    joined
}
