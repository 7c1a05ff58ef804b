#![cfg(unix)]

use approx::assert_abs_diff_eq;
use pgic::data::PersonId;
use pgic::heritability::{Bolt, Gcta, HeritabilityError, HeritabilityEstimator, HeritabilityRequest};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// Writes an executable shell script that appends its arguments to `calls.txt`.
fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\necho \"$@\" >> \"{}\"\n{body}\n",
        dir.join("calls.txt").display()
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn calls(dir: &Path) -> Vec<String> {
    fs::read_to_string(dir.join("calls.txt"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

const FAKE_GCTA: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--out" ]; then out="$2"; fi
  shift
done
printf 'Source\tVariance\tSE\nV(G)\t0.3\t0.02\nV(G)/Vp\t0.345\t0.021\n' > "$out.log""#;

fn gcta(dir: &Path) -> Gcta {
    Gcta {
        executable: fake_tool(dir, "gcta64", FAKE_GCTA),
        grm: dir.join("full_grm"),
        pheno_file: dir.join("pheno.txt"),
        grm_cutoff: 0.025,
        threads: 2,
    }
}

#[test]
fn gcta_full_sample_runs_reml_only() {
    let dir = tempdir().unwrap();
    let scratch = dir.path().join("scratch");
    fs::create_dir(&scratch).unwrap();
    let estimator = gcta(dir.path());

    let request = HeritabilityRequest {
        scratch_dir: &scratch,
        excluded: &[],
        label: "full sample",
    };
    let h2 = estimator.estimate(&request).unwrap();
    assert_abs_diff_eq!(h2, 0.345, epsilon = 1e-12);

    let calls = calls(dir.path());
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("--reml"));
    assert!(calls[0].contains("--grm-cutoff 0.025"));
    assert!(calls[0].contains("--threads 2"));
    assert!(calls[0].contains(&format!("--grm {}", dir.path().join("full_grm").display())));
}

#[test]
fn gcta_block_restricts_the_grm_first() {
    let dir = tempdir().unwrap();
    let scratch = dir.path().join("jk_block_0");
    fs::create_dir(&scratch).unwrap();
    let estimator = gcta(dir.path());
    let excluded = vec![PersonId::new("f1", "i1"), PersonId::single("p2")];

    let request = HeritabilityRequest {
        scratch_dir: &scratch,
        excluded: &excluded,
        label: "jackknife block 0",
    };
    estimator.estimate(&request).unwrap();

    assert_eq!(
        fs::read_to_string(scratch.join("removed.txt")).unwrap(),
        "f1 i1\np2 p2\n"
    );
    let calls = calls(dir.path());
    assert_eq!(calls.len(), 2);
    assert!(calls[0].contains("--remove") && calls[0].contains("--make-grm"));
    assert!(calls[1].contains(&format!("--grm {}", scratch.join("removed_grm").display())));
}

#[test]
fn gcta_builds_a_grm_from_plink_files() {
    let dir = tempdir().unwrap();
    let executable = fake_tool(dir.path(), "gcta64", FAKE_GCTA);
    let prefix = dir.path().join("grm");
    let built = Gcta::build_grm(&executable, &dir.path().join("geno"), &prefix, 4).unwrap();
    assert_eq!(built, prefix);
    let calls = calls(dir.path());
    assert!(calls[0].contains("--make-grm"));
    assert!(calls[0].contains("--bfile"));
}

#[test]
fn bolt_reads_its_standard_output() {
    let dir = tempdir().unwrap();
    let scratch = dir.path().join("jk_block_3");
    fs::create_dir(&scratch).unwrap();
    let estimator = Bolt {
        executable: fake_tool(dir.path(), "bolt", "echo 'h2g (1,1): 0.21 (0.01)'"),
        bfile: dir.path().join("geno"),
        pheno_file: dir.path().join("pheno.txt"),
        pheno_column: "PHENOTYPE".to_string(),
        threads: 1,
    };
    let excluded = vec![PersonId::single("7")];
    let request = HeritabilityRequest {
        scratch_dir: &scratch,
        excluded: &excluded,
        label: "jackknife block 3",
    };
    let h2 = estimator.estimate(&request).unwrap();
    assert_abs_diff_eq!(h2, 0.21, epsilon = 1e-12);

    let calls = calls(dir.path());
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("--phenoCol=PHENOTYPE"));
    assert!(calls[0].contains("--maxModelSnps=2000000"));
    assert!(calls[0].contains(&format!("--remove={}", scratch.join("removed.txt").display())));
    assert!(scratch.join("h2est.log").exists());
}

#[test]
fn missing_marker_names_the_log() {
    let dir = tempdir().unwrap();
    let estimator = Bolt {
        executable: fake_tool(dir.path(), "bolt", "echo 'nothing to see'"),
        bfile: dir.path().join("geno"),
        pheno_file: dir.path().join("pheno.txt"),
        pheno_column: "PHENOTYPE".to_string(),
        threads: 1,
    };
    let request = HeritabilityRequest {
        scratch_dir: dir.path(),
        excluded: &[],
        label: "full sample",
    };
    match estimator.estimate(&request) {
        Err(HeritabilityError::MarkerNotFound { marker, path }) => {
            assert_eq!(marker, "h2g (1,1):");
            assert_eq!(path, dir.path().join("h2est.log"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn tool_failure_carries_status_and_stderr() {
    let dir = tempdir().unwrap();
    let estimator = Gcta {
        executable: fake_tool(dir.path(), "gcta64", "echo 'bad GRM' >&2\nexit 3"),
        grm: dir.path().join("grm"),
        pheno_file: dir.path().join("pheno.txt"),
        grm_cutoff: 0.025,
        threads: 1,
    };
    let request = HeritabilityRequest {
        scratch_dir: dir.path(),
        excluded: &[],
        label: "full sample",
    };
    match estimator.estimate(&request) {
        Err(HeritabilityError::ToolFailed { tool, status, stderr }) => {
            assert_eq!(tool, "GCTA");
            assert_eq!(status.code(), Some(3));
            assert_eq!(stderr, "bad GRM");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
