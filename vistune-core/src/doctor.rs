//! Environment diagnostics for the external training stack.
//!
//! Checks the interpreter, the Python packages the stages import, the
//! launcher binary and the visible GPUs. Nothing here is fatal: missing
//! pieces are reported so the user can fix them before launching.

use crate::config::{LauncherConfig, LauncherKind};
use crate::finetune::python_program;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Packages the trainer and merge scripts import.
pub const REQUIRED_PACKAGES: &[&str] = &["torch", "transformers", "peft", "deepspeed"];

const CHECK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PythonInfo {
    pub path: PathBuf,
    pub version: String,
    pub has_pip: bool,
    pub venv_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_mib: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorReport {
    pub python: Option<PythonInfo>,
    pub packages: BTreeMap<String, bool>,
    pub launcher: String,
    pub launcher_on_path: Option<PathBuf>,
    pub gpus: Vec<GpuInfo>,
    pub gpu_error: Option<String>,
    pub cuda_env: BTreeMap<String, String>,
}

impl DoctorReport {
    /// Everything needed for a launch was found.
    pub fn is_ready(&self) -> bool {
        self.python.is_some()
            && self.packages.values().all(|ok| *ok)
            && self.launcher_on_path.is_some()
    }
}

/// Run `program args` and capture stdout (or stderr when stdout is empty).
async fn capture(program: &str, args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(CHECK_TIMEOUT, Command::new(program).args(args).output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        debug!(program, status = %output.status, "Check failed");
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        Some(String::from_utf8_lossy(&output.stderr).trim().to_string())
    } else {
        Some(stdout)
    }
}

/// Detect the configured interpreter, falling back to `python3`.
pub async fn detect_python(preferred: &str) -> Option<PythonInfo> {
    for cmd in [preferred, "python3"] {
        if let Some(version) = capture(cmd, &["--version"]).await {
            let has_pip = capture(cmd, &["-m", "pip", "--version"]).await.is_some();
            return Some(PythonInfo {
                path: PathBuf::from(cmd),
                version,
                has_pip,
                venv_path: std::env::var_os("VIRTUAL_ENV").map(PathBuf::from),
            });
        }
    }
    None
}

/// Which of `packages` import cleanly.
pub async fn check_packages(python: &str, packages: &[&str]) -> BTreeMap<String, bool> {
    let mut results = BTreeMap::new();
    for pkg in packages {
        let script = format!("import importlib; importlib.import_module('{pkg}')");
        let available = capture(python, &["-c", &script]).await.is_some();
        results.insert(pkg.to_string(), available);
    }
    results
}

/// Locate `program` on `PATH`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Parse `nvidia-smi --query-gpu=index,name,memory.total --format=csv,noheader,nounits`.
///
/// Malformed lines are skipped.
pub fn parse_nvidia_smi(csv: &str) -> Vec<GpuInfo> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let index = fields.next()?.parse().ok()?;
            let name = fields.next()?.to_string();
            let memory_mib = fields.next()?.parse().ok()?;
            Some(GpuInfo {
                index,
                name,
                memory_mib,
            })
        })
        .collect()
}

pub async fn query_gpus() -> Result<Vec<GpuInfo>, String> {
    let output = capture(
        "nvidia-smi",
        &[
            "--query-gpu=index,name,memory.total",
            "--format=csv,noheader,nounits",
        ],
    )
    .await
    .ok_or_else(|| "nvidia-smi unavailable or failed".to_string())?;
    Ok(parse_nvidia_smi(&output))
}

/// Environment variables mentioning CUDA.
pub fn cuda_env() -> BTreeMap<String, String> {
    std::env::vars().filter(|(k, _)| k.contains("CUDA")).collect()
}

pub async fn diagnose(launcher: &LauncherConfig) -> DoctorReport {
    let python_cmd = python_program(launcher);
    let python = detect_python(&python_cmd).await;
    let packages = match &python {
        Some(info) => check_packages(&info.path.to_string_lossy(), REQUIRED_PACKAGES).await,
        None => REQUIRED_PACKAGES
            .iter()
            .map(|p| (p.to_string(), false))
            .collect(),
    };
    let launcher_name = match launcher.kind {
        LauncherKind::Python => python_cmd.clone(),
        kind => kind.to_string(),
    };
    let launcher_on_path = if PathBuf::from(&launcher_name).components().count() > 1 {
        Some(PathBuf::from(&launcher_name)).filter(|p| p.is_file())
    } else {
        find_on_path(&launcher_name)
    };
    let (gpus, gpu_error) = match query_gpus().await {
        Ok(gpus) => (gpus, None),
        Err(e) => (Vec::new(), Some(e)),
    };

    DoctorReport {
        python,
        packages,
        launcher: launcher_name,
        launcher_on_path,
        gpus,
        gpu_error,
        cuda_env: cuda_env(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nvidia_smi() {
        let csv = "0, NVIDIA A100-SXM4-80GB, 81920\n1, NVIDIA A100-SXM4-80GB, 81920\n\ngarbage\n";
        let gpus = parse_nvidia_smi(csv);
        assert_eq!(gpus.len(), 2);
        assert_eq!(
            gpus[1],
            GpuInfo {
                index: 1,
                name: "NVIDIA A100-SXM4-80GB".into(),
                memory_mib: 81920
            }
        );
    }

    #[test]
    fn test_parse_nvidia_smi_empty() {
        assert!(parse_nvidia_smi("").is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_find_on_path() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("vistune-no-such-tool").is_none());
    }

    #[test]
    fn test_report_readiness() {
        let mut report = DoctorReport {
            python: Some(PythonInfo {
                path: PathBuf::from("python3"),
                version: "Python 3.11.0".into(),
                has_pip: true,
                venv_path: None,
            }),
            packages: REQUIRED_PACKAGES.iter().map(|p| (p.to_string(), true)).collect(),
            launcher: "deepspeed".into(),
            launcher_on_path: Some(PathBuf::from("/usr/bin/deepspeed")),
            gpus: Vec::new(),
            gpu_error: None,
            cuda_env: BTreeMap::new(),
        };
        assert!(report.is_ready());
        report.packages.insert("peft".into(), false);
        assert!(!report.is_ready());
    }

    #[tokio::test]
    async fn test_diagnose_does_not_panic() {
        // Tools may or may not be installed where this runs.
        let report = diagnose(&LauncherConfig::default()).await;
        assert_eq!(report.launcher, "deepspeed");
        assert_eq!(report.packages.len(), REQUIRED_PACKAGES.len());
    }
}
