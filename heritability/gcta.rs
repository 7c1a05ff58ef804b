use super::{
    Capture, HeritabilityError, HeritabilityEstimator, HeritabilityRequest, MarkerLine, run_tool,
    with_suffix, write_removal_file,
};
use log::info;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const TOOL: &str = "GCTA";

/// Executable name GCTA ships under.
pub const EXPECTED_EXECUTABLE: &str = "gcta64";

pub const DEFAULT_GRM_CUTOFF: f64 = 0.025;

/// GCTA GREML against a prebuilt genetic relatedness matrix.
#[derive(Debug, Clone)]
pub struct Gcta {
    pub executable: PathBuf,
    /// Prefix of the `.grm.bin`, `.grm.id`, `.grm.N.bin` trio.
    pub grm: PathBuf,
    pub pheno_file: PathBuf,
    pub grm_cutoff: f64,
    pub threads: usize,
}

impl Gcta {
    /// Builds a GRM from PLINK files and returns its prefix.
    pub fn build_grm(
        executable: &Path,
        bfile: &Path,
        out_prefix: &Path,
        threads: usize,
    ) -> Result<PathBuf, HeritabilityError> {
        info!("Building GRM from {} ...", bfile.display());
        let args: Vec<OsString> = vec![
            "--bfile".into(),
            bfile.into(),
            "--make-grm".into(),
            "--out".into(),
            out_prefix.into(),
            "--threads".into(),
            threads.to_string().into(),
        ];
        run_tool(TOOL, executable, &args, Capture::Log)?;
        Ok(out_prefix.to_path_buf())
    }

    /// Writes a GRM restricted to everyone not in `request.excluded`.
    fn restricted_grm(&self, request: &HeritabilityRequest<'_>) -> Result<PathBuf, HeritabilityError> {
        let removal = request.scratch_dir.join("removed.txt");
        write_removal_file(&removal, request.excluded)
            .map_err(|source| HeritabilityError::Io { tool: TOOL, source })?;

        let restricted = request.scratch_dir.join("removed_grm");
        let args: Vec<OsString> = vec![
            "--grm".into(),
            self.grm.clone().into(),
            "--remove".into(),
            removal.into(),
            "--out".into(),
            restricted.clone().into(),
            "--make-grm".into(),
            "--threads".into(),
            self.threads.to_string().into(),
        ];
        run_tool(TOOL, &self.executable, &args, Capture::Log)?;
        Ok(restricted)
    }
}

impl HeritabilityEstimator for Gcta {
    fn name(&self) -> &'static str {
        TOOL
    }

    fn estimate(&self, request: &HeritabilityRequest<'_>) -> Result<f64, HeritabilityError> {
        info!("Estimating heritability using {TOOL} ({})...", request.label);
        let grm = if request.excluded.is_empty() {
            self.grm.clone()
        } else {
            self.restricted_grm(request)?
        };

        let prefix = request.scratch_dir.join("h2est");
        let args: Vec<OsString> = vec![
            "--grm".into(),
            grm.into(),
            "--pheno".into(),
            self.pheno_file.clone().into(),
            "--reml".into(),
            "--grm-cutoff".into(),
            self.grm_cutoff.to_string().into(),
            "--out".into(),
            prefix.clone().into(),
            "--threads".into(),
            self.threads.to_string().into(),
        ];
        run_tool(TOOL, &self.executable, &args, Capture::Log)?;

        MarkerLine::Gcta.read_from(TOOL, &with_suffix(&prefix, ".log"))
    }
}
