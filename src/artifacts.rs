use crate::config_files::write_atomic_text_file;
use crate::UrlctlError;
use std::path::{Path, PathBuf};

pub(crate) const WINDOWS_SCRIPT: &str = "start_webfuzzing.bat";
pub(crate) const UNIX_SCRIPT: &str = "start_webfuzzing.sh";
pub(crate) const SERVICE_UNIT: &str = "webfuzzing.service";
pub(crate) const ARTIFACT_FILES: &[&str] = &[WINDOWS_SCRIPT, UNIX_SCRIPT, SERVICE_UNIT];

const FALLBACK_PYTHON: &str = "/usr/bin/python3";
const ENTRY_POINT: &str = "main.py";
const ENTRY_MODE: &str = "all";
const RESTART_SEC: u32 = 10;

#[derive(Debug, Clone)]
pub(crate) struct ArtifactParams {
    pub(crate) root: PathBuf,
    pub(crate) python: PathBuf,
    pub(crate) user: String,
    pub(crate) include_service_unit: bool,
}

impl ArtifactParams {
    pub(crate) fn for_host(root: &Path, python: Option<&Path>) -> Self {
        let user = std::env::var("USER")
            .ok()
            .filter(|user| !user.trim().is_empty())
            .unwrap_or_else(|| "root".to_string());
        Self {
            root: root.to_path_buf(),
            python: python
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(FALLBACK_PYTHON)),
            user,
            include_service_unit: cfg!(unix),
        }
    }
}

/// systemd needs an absolute `ExecStart=`; flags an interpreter that was
/// guessed or given as a bare name.
pub(crate) fn interpreter_warning(python: Option<&Path>) -> Option<String> {
    match python {
        None => Some(format!(
            "no python interpreter found; {SERVICE_UNIT} uses {FALLBACK_PYTHON}"
        )),
        Some(path) if !path.is_absolute() => Some(format!(
            "interpreter '{}' is not an absolute path; fix ExecStart= in {SERVICE_UNIT}",
            path.display()
        )),
        Some(_) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Artifact {
    pub(crate) file_name: &'static str,
    pub(crate) content: String,
    pub(crate) mode: Option<u32>,
}

fn windows_script(root: &Path) -> String {
    [
        "@echo off".to_string(),
        format!("cd /d \"{}\"", root.display()),
        format!("python {ENTRY_POINT} --mode {ENTRY_MODE}"),
        "pause".to_string(),
    ]
    .iter()
    .map(|line| format!("{line}\r\n"))
    .collect()
}

fn unix_script(root: &Path) -> String {
    format!(
        "#!/bin/bash\ncd \"{root}\" || exit 1\nexec python3 {ENTRY_POINT} --mode {ENTRY_MODE}\n",
        root = root.display()
    )
}

fn service_unit(params: &ArtifactParams) -> String {
    let root = params.root.display();
    format!(
        "[Unit]
Description=WebFuzzing Pro Service
After=network.target

[Service]
Type=simple
User={user}
WorkingDirectory={root}
ExecStart=\"{python}\" \"{root}/{ENTRY_POINT}\" --mode {ENTRY_MODE}
Restart=always
RestartSec={RESTART_SEC}

[Install]
WantedBy=multi-user.target
",
        user = params.user,
        python = params.python.display(),
    )
}

pub(crate) fn render_artifacts(params: &ArtifactParams) -> Vec<Artifact> {
    let mut artifacts = vec![
        Artifact {
            file_name: WINDOWS_SCRIPT,
            content: windows_script(&params.root),
            mode: None,
        },
        Artifact {
            file_name: UNIX_SCRIPT,
            content: unix_script(&params.root),
            mode: Some(0o755),
        },
    ];
    if params.include_service_unit {
        artifacts.push(Artifact {
            file_name: SERVICE_UNIT,
            content: service_unit(params),
            mode: Some(0o644),
        });
    }
    artifacts
}

/// Writes every artifact under the project root. Each write is independent;
/// a failure is reported for that file and the rest are still attempted.
pub(crate) fn write_artifacts(
    params: &ArtifactParams,
) -> Vec<(PathBuf, Result<(), UrlctlError>)> {
    render_artifacts(params)
        .into_iter()
        .map(|artifact| {
            let path = params.root.join(artifact.file_name);
            let result = write_atomic_text_file(&path, &artifact.content, artifact.mode);
            match &result {
                Ok(()) => tracing::info!(path = %path.display(), "wrote startup artifact"),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "startup artifact failed")
                }
            }
            (path, result)
        })
        .collect()
}

pub(crate) fn scheduled_task_instructions(params: &ArtifactParams, windows: bool) -> Vec<String> {
    let root = params.root.display();
    if windows {
        return vec![
            "Windows Task Scheduler:".to_string(),
            "  1. Open Task Scheduler and create a basic task".to_string(),
            "  2. Program: python".to_string(),
            format!("  3. Arguments: {root}\\{ENTRY_POINT} --mode {ENTRY_MODE}"),
            format!("  4. Start in: {root}"),
            "  5. Trigger: at system startup".to_string(),
        ];
    }
    let service_path = params.root.join(SERVICE_UNIT);
    vec![
        "crontab:".to_string(),
        "  1. crontab -e".to_string(),
        format!("  2. @reboot cd {root} && python3 {ENTRY_POINT} --mode {ENTRY_MODE}"),
        "systemd:".to_string(),
        format!(
            "  1. sudo cp {} /etc/systemd/system/",
            service_path.display()
        ),
        format!("  2. sudo systemctl enable {SERVICE_UNIT}"),
        format!("  3. sudo systemctl start {SERVICE_UNIT}"),
    ]
}
