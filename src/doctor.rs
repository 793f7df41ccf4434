use crate::config_files::{self, ConfigFileState, ConfigFormat};
use crate::smoke::{self, FlaskLauncher, SmokeLauncher, SmokeSettings};
use crate::{print_json, Context, JsonResult, UrlctlError};
use chrono::Utc;
use dialoguer::console::style;
use serde::{Deserialize, Serialize};
use std::env;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

pub(crate) const CHECK_RUNTIME: &str = "runtime";
pub(crate) const CHECK_PACKAGES: &str = "packages";
pub(crate) const CHECK_PORTS: &str = "ports";
pub(crate) const CHECK_LAYOUT: &str = "layout";
pub(crate) const CHECK_CONFIG_FILES: &str = "config_files";
pub(crate) const CHECK_PROCESSES: &str = "processes";
pub(crate) const CHECK_SMOKE_TEST: &str = "smoke_test";

pub(crate) const DASHBOARD_PORT: u16 = 5000;
pub(crate) const API_PORT: u16 = 8000;
pub(crate) const CANDIDATE_PORTS: &[u16] = &[DASHBOARD_PORT, API_PORT, 8080, 3000];
const PORT_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) const EXPECTED_PATHS: &[&str] = &[
    "web/app.py",
    "api/app.py",
    "core/fuzzing_engine.py",
    "requirements.txt",
    "main.py",
    "config.json",
    "config/",
    "logs/",
    "data/",
];

pub(crate) const CONFIG_CANDIDATES: &[(&str, ConfigFormat)] = &[
    (".env", ConfigFormat::Env),
    ("config.json", ConfigFormat::Json),
    ("config/config.json", ConfigFormat::Json),
    ("config.yaml", ConfigFormat::Yaml),
    ("config/config.yaml", ConfigFormat::Yaml),
    ("config/settings.yaml", ConfigFormat::Yaml),
];

const INTERPRETER_PROCESS_PATTERN: &str = "python";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RequiredPackage {
    pub(crate) module: &'static str,
    pub(crate) pip_name: &'static str,
}

pub(crate) const REQUIRED_PACKAGES: &[RequiredPackage] = &[
    RequiredPackage { module: "flask", pip_name: "flask" },
    RequiredPackage { module: "flask_cors", pip_name: "flask-cors" },
    RequiredPackage { module: "flask_restful", pip_name: "flask-restful" },
    RequiredPackage { module: "flask_socketio", pip_name: "flask-socketio" },
    RequiredPackage { module: "requests", pip_name: "requests" },
    RequiredPackage { module: "bs4", pip_name: "beautifulsoup4" },
    RequiredPackage { module: "colorama", pip_name: "colorama" },
    RequiredPackage { module: "tqdm", pip_name: "tqdm" },
];

const IDENTITY_SCRIPT: &str = "import json, platform, sys; print(json.dumps({\
\"version\": platform.python_version(), \
\"executable\": sys.executable, \
\"prefix\": sys.prefix, \
\"base_prefix\": getattr(sys, \"base_prefix\", sys.prefix), \
\"real_prefix\": getattr(sys, \"real_prefix\", None)}))";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum CheckStatus {
    Ok,
    Missing,
    Error,
    Skipped,
}

impl CheckStatus {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Missing => "MISSING",
            Self::Error => "ERROR",
            Self::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CheckItem {
    pub(crate) label: String,
    pub(crate) status: CheckStatus,
    pub(crate) detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CheckResult {
    pub(crate) name: String,
    pub(crate) status: CheckStatus,
    pub(crate) detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) remediation: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) items: Vec<CheckItem>,
}

fn check_result(
    name: &str,
    status: CheckStatus,
    detail: impl Into<String>,
    items: Vec<CheckItem>,
    remediation_context: &str,
) -> CheckResult {
    CheckResult {
        name: name.to_string(),
        status,
        detail: detail.into(),
        remediation: remediation_for(name, status, remediation_context),
        items,
    }
}

fn item(label: impl Into<String>, status: CheckStatus, detail: impl Into<String>) -> CheckItem {
    CheckItem {
        label: label.into(),
        status,
        detail: detail.into(),
    }
}

/// Remediation text keyed by check name and status. `{missing}` is replaced
/// with the failing entries of that check, `{context}` with the interpreter.
const REMEDIATIONS: &[(&str, CheckStatus, &str)] = &[
    (
        CHECK_RUNTIME,
        CheckStatus::Error,
        "install Python 3 or point urlctl at the project interpreter: urlctl --python /path/to/python3 doctor",
    ),
    (CHECK_PACKAGES, CheckStatus::Missing, "{context} -m pip install {missing}"),
    (
        CHECK_LAYOUT,
        CheckStatus::Missing,
        "restore the missing project paths ({missing}) or re-run the installer from the project root",
    ),
    (CHECK_CONFIG_FILES, CheckStatus::Missing, "urlctl config init"),
    (CHECK_CONFIG_FILES, CheckStatus::Error, "fix the syntax errors in {missing}"),
    (
        CHECK_PORTS,
        CheckStatus::Error,
        "check that localhost resolves and no local firewall blocks loopback connections",
    ),
    (
        CHECK_PROCESSES,
        CheckStatus::Error,
        "list interpreter processes manually: ps aux | grep python",
    ),
    (
        CHECK_SMOKE_TEST,
        CheckStatus::Error,
        "start the dashboard manually to see the full traceback: {context} -m web.app",
    ),
    (
        CHECK_SMOKE_TEST,
        CheckStatus::Skipped,
        "install the missing packages, then re-run urlctl doctor",
    ),
];

fn remediation_for(name: &str, status: CheckStatus, missing: &str) -> Option<String> {
    REMEDIATIONS
        .iter()
        .find(|(check, wanted, _)| *check == name && *wanted == status)
        .map(|(_, _, text)| text.replace("{missing}", missing))
}

#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    pub(crate) status_code: i32,
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }

    fn last_stderr_line(&self) -> String {
        String::from_utf8_lossy(&self.stderr)
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| line.trim().to_string())
            .unwrap_or_else(|| format!("exit status {}", self.status_code))
    }
}

pub(crate) trait InterpreterRunner {
    fn run(&self, args: &[&str]) -> Result<CommandOutput, io::Error>;
    fn executable(&self) -> &Path;
}

pub(crate) struct PythonRunner {
    executable: PathBuf,
}

impl PythonRunner {
    pub(crate) fn new(executable: PathBuf) -> Self {
        Self { executable }
    }
}

impl InterpreterRunner for PythonRunner {
    fn run(&self, args: &[&str]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn executable(&self) -> &Path {
        &self.executable
    }
}

#[derive(Debug, Deserialize)]
struct InterpreterIdentity {
    version: String,
    executable: String,
    prefix: String,
    base_prefix: String,
    #[serde(default)]
    real_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RuntimeInfo {
    pub(crate) version: String,
    pub(crate) executable: String,
    pub(crate) prefix: String,
    pub(crate) isolated: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct PackageStatus {
    pub(crate) package: RequiredPackage,
    pub(crate) importable: bool,
    pub(crate) detail: String,
}

#[derive(Debug, Clone)]
pub(crate) struct EnvironmentReport {
    pub(crate) runtime: Result<RuntimeInfo, String>,
    pub(crate) packages: Vec<PackageStatus>,
}

impl EnvironmentReport {
    pub(crate) fn missing_packages(&self) -> Vec<RequiredPackage> {
        self.packages
            .iter()
            .filter(|status| !status.importable)
            .map(|status| status.package)
            .collect()
    }
}

fn probe_identity(runner: &dyn InterpreterRunner) -> Result<RuntimeInfo, String> {
    let output = runner
        .run(&["-c", IDENTITY_SCRIPT])
        .map_err(|err| format!("failed to run {}: {err}", runner.executable().display()))?;
    if !output.success() {
        return Err(output.last_stderr_line());
    }
    let identity: InterpreterIdentity = serde_json::from_slice(&output.stdout)
        .map_err(|err| format!("unexpected interpreter output: {err}"))?;
    let isolated = identity.real_prefix.is_some() || identity.prefix != identity.base_prefix;
    Ok(RuntimeInfo {
        version: identity.version,
        executable: identity.executable,
        prefix: identity.prefix,
        isolated,
    })
}

fn probe_package(runner: &dyn InterpreterRunner, package: RequiredPackage) -> PackageStatus {
    let statement = format!("import {}", package.module);
    let (importable, detail) = match runner.run(&["-c", &statement]) {
        Ok(output) if output.success() => (true, "importable".to_string()),
        Ok(output) => (false, output.last_stderr_line()),
        Err(err) => (false, format!("import attempt failed: {err}")),
    };
    tracing::debug!(module = package.module, importable, "probed package");
    PackageStatus {
        package,
        importable,
        detail,
    }
}

/// Import failures of any kind are recorded as missing packages.
pub(crate) fn probe_environment(runner: Option<&dyn InterpreterRunner>) -> EnvironmentReport {
    let Some(runner) = runner else {
        return EnvironmentReport {
            runtime: Err("no python interpreter found on PATH".to_string()),
            packages: REQUIRED_PACKAGES
                .iter()
                .map(|package| PackageStatus {
                    package: *package,
                    importable: false,
                    detail: "interpreter unavailable".to_string(),
                })
                .collect(),
        };
    };
    let runtime = probe_identity(runner);
    let packages = REQUIRED_PACKAGES
        .iter()
        .map(|package| probe_package(runner, *package))
        .collect();
    EnvironmentReport { runtime, packages }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PortState {
    Occupied,
    Available,
    Error(String),
}

pub(crate) fn probe_port(port: u16, timeout: Duration) -> PortState {
    let addrs: Vec<SocketAddr> = match ("localhost", port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(err) => return PortState::Error(err.to_string()),
    };
    let Some(addr) = addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
    else {
        return PortState::Error("localhost did not resolve".to_string());
    };
    match TcpStream::connect_timeout(addr, timeout) {
        Ok(_stream) => PortState::Occupied,
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => PortState::Available,
        Err(err) => PortState::Error(err.to_string()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathState {
    Exists,
    Missing,
}

#[derive(Debug, Clone)]
pub(crate) struct LayoutReport {
    pub(crate) entries: Vec<(String, PathState)>,
    pub(crate) missing: usize,
}

/// Entries ending in `/` must be directories.
pub(crate) fn check_layout(root: &Path, expected: &[&str]) -> LayoutReport {
    let entries: Vec<(String, PathState)> = expected
        .iter()
        .map(|relative| {
            let path = root.join(relative.trim_end_matches('/'));
            let present = if relative.ends_with('/') {
                path.is_dir()
            } else {
                path.exists()
            };
            let state = if present {
                PathState::Exists
            } else {
                PathState::Missing
            };
            (relative.to_string(), state)
        })
        .collect();
    let missing = entries
        .iter()
        .filter(|(_, state)| *state == PathState::Missing)
        .count();
    LayoutReport { entries, missing }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcessEntry {
    pub(crate) pid: u32,
    pub(crate) name: String,
    pub(crate) memory_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProcessScan {
    Unsupported,
    Found(Vec<ProcessEntry>),
}

pub(crate) fn list_interpreter_processes(pattern: &str) -> ProcessScan {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return ProcessScan::Unsupported;
    }
    let mut sys = sysinfo::System::new();
    sys.refresh_processes();
    let needle = pattern.to_lowercase();
    let mut found: Vec<ProcessEntry> = sys
        .processes()
        .iter()
        .filter(|(_, process)| process.name().to_lowercase().contains(&needle))
        .map(|(pid, process)| ProcessEntry {
            pid: pid.as_u32(),
            name: process.name().to_string(),
            memory_bytes: process.memory(),
        })
        .collect();
    found.sort_by_key(|entry| entry.pid);
    ProcessScan::Found(found)
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct DiagnosticReport {
    pub(crate) generated_at: String,
    pub(crate) root: PathBuf,
    pub(crate) checks: Vec<CheckResult>,
    pub(crate) missing_packages: Vec<String>,
    pub(crate) missing_paths: usize,
    pub(crate) solution_commands: Vec<String>,
    pub(crate) summary: Vec<String>,
}

impl DiagnosticReport {
    pub(crate) fn healthy(&self) -> bool {
        self.checks
            .iter()
            .all(|check| matches!(check.status, CheckStatus::Ok))
    }
}

pub(crate) struct DoctorDeps<'a> {
    pub(crate) runner: Option<&'a dyn InterpreterRunner>,
    pub(crate) launcher: Option<&'a dyn SmokeLauncher>,
    pub(crate) ports: &'a [u16],
    pub(crate) port_timeout: Duration,
    pub(crate) smoke: SmokeSettings,
    pub(crate) python_display: String,
}

fn runtime_check(env_report: &EnvironmentReport) -> CheckResult {
    match &env_report.runtime {
        Ok(info) => {
            let isolated = if info.isolated { "active" } else { "not active" };
            let mut items = vec![
                item("version", CheckStatus::Ok, &info.version),
                item("executable", CheckStatus::Ok, &info.executable),
                item("isolated runtime", CheckStatus::Ok, isolated),
            ];
            if info.isolated {
                items.push(item("runtime prefix", CheckStatus::Ok, &info.prefix));
            }
            check_result(
                CHECK_RUNTIME,
                CheckStatus::Ok,
                format!("Python {} (virtual environment {isolated})", info.version),
                items,
                "",
            )
        }
        Err(err) => {
            let items = fallback_runtime_items(env::var("VIRTUAL_ENV").ok());
            check_result(CHECK_RUNTIME, CheckStatus::Error, err, items, "")
        }
    }
}

/// Isolation as far as `VIRTUAL_ENV` can tell when the interpreter itself
/// could not be queried.
fn fallback_runtime_items(virtual_env: Option<String>) -> Vec<CheckItem> {
    match virtual_env.filter(|path| !path.trim().is_empty()) {
        Some(path) => vec![
            item("isolated runtime", CheckStatus::Ok, "active (VIRTUAL_ENV)"),
            item("runtime prefix", CheckStatus::Ok, path),
        ],
        None => vec![item(
            "isolated runtime",
            CheckStatus::Ok,
            "not active (VIRTUAL_ENV unset)",
        )],
    }
}

fn packages_check(env_report: &EnvironmentReport, python: &str) -> CheckResult {
    let items: Vec<CheckItem> = env_report
        .packages
        .iter()
        .map(|status| {
            let state = if status.importable {
                CheckStatus::Ok
            } else {
                CheckStatus::Missing
            };
            item(status.package.pip_name, state, &status.detail)
        })
        .collect();
    let missing = env_report.missing_packages();
    if missing.is_empty() {
        return check_result(
            CHECK_PACKAGES,
            CheckStatus::Ok,
            format!("all {} packages importable", items.len()),
            items,
            "",
        );
    }
    let names: Vec<&str> = missing.iter().map(|package| package.pip_name).collect();
    let mut result = check_result(
        CHECK_PACKAGES,
        CheckStatus::Missing,
        format!("{} of {} packages missing", missing.len(), items.len()),
        items,
        &names.join(" "),
    );
    result.remediation = result
        .remediation
        .map(|text| text.replace("{context}", python));
    result
}

fn ports_check(ports: &[u16], timeout: Duration) -> CheckResult {
    let mut errors = 0usize;
    let mut occupied = 0usize;
    let items: Vec<CheckItem> = ports
        .iter()
        .map(|port| {
            let state = probe_port(*port, timeout);
            tracing::debug!(port, ?state, "probed port");
            match state {
                PortState::Occupied => {
                    occupied += 1;
                    item(port.to_string(), CheckStatus::Ok, "OCCUPIED")
                }
                PortState::Available => item(port.to_string(), CheckStatus::Ok, "AVAILABLE"),
                PortState::Error(err) => {
                    errors += 1;
                    item(port.to_string(), CheckStatus::Error, err)
                }
            }
        })
        .collect();
    let status = if errors > 0 {
        CheckStatus::Error
    } else {
        CheckStatus::Ok
    };
    let detail = format!(
        "{occupied} occupied, {} available, {errors} errors",
        ports.len() - occupied - errors
    );
    check_result(CHECK_PORTS, status, detail, items, "")
}

fn layout_check(layout: &LayoutReport) -> CheckResult {
    let items: Vec<CheckItem> = layout
        .entries
        .iter()
        .map(|(path, state)| match state {
            PathState::Exists => item(path, CheckStatus::Ok, "EXISTS"),
            PathState::Missing => item(path, CheckStatus::Missing, "MISSING"),
        })
        .collect();
    if layout.missing == 0 {
        return check_result(
            CHECK_LAYOUT,
            CheckStatus::Ok,
            "project structure OK",
            items,
            "",
        );
    }
    let missing: Vec<&str> = layout
        .entries
        .iter()
        .filter(|(_, state)| *state == PathState::Missing)
        .map(|(path, _)| path.as_str())
        .collect();
    check_result(
        CHECK_LAYOUT,
        CheckStatus::Missing,
        format!("{} of {} paths missing", layout.missing, layout.entries.len()),
        items,
        &missing.join(", "),
    )
}

fn config_files_check(root: &Path) -> CheckResult {
    let mut missing = Vec::new();
    let mut broken = Vec::new();
    let items: Vec<CheckItem> = CONFIG_CANDIDATES
        .iter()
        .map(|(relative, format)| {
            match config_files::validate_config_file(&root.join(relative), *format) {
                ConfigFileState::Valid(detail) => item(*relative, CheckStatus::Ok, detail),
                ConfigFileState::Missing => {
                    missing.push(*relative);
                    item(*relative, CheckStatus::Missing, "MISSING")
                }
                ConfigFileState::Invalid(err) => {
                    broken.push(*relative);
                    item(*relative, CheckStatus::Error, err)
                }
            }
        })
        .collect();
    if !broken.is_empty() {
        return check_result(
            CHECK_CONFIG_FILES,
            CheckStatus::Error,
            format!("{} config files failed to parse", broken.len()),
            items,
            &broken.join(", "),
        );
    }
    if !missing.is_empty() {
        return check_result(
            CHECK_CONFIG_FILES,
            CheckStatus::Missing,
            format!("{} config files missing", missing.len()),
            items,
            &missing.join(", "),
        );
    }
    check_result(
        CHECK_CONFIG_FILES,
        CheckStatus::Ok,
        "all config files parse",
        items,
        "",
    )
}

fn processes_check(scan: ProcessScan) -> CheckResult {
    match scan {
        ProcessScan::Unsupported => check_result(
            CHECK_PROCESSES,
            CheckStatus::Skipped,
            "process listing is not supported on this platform",
            Vec::new(),
            "",
        ),
        ProcessScan::Found(entries) => {
            let detail = if entries.is_empty() {
                "no python processes running".to_string()
            } else {
                format!("{} python processes running", entries.len())
            };
            let items = entries
                .into_iter()
                .map(|entry| {
                    item(
                        format!("pid {}", entry.pid),
                        CheckStatus::Ok,
                        format!("{} ({} KiB)", entry.name, entry.memory_bytes / 1024),
                    )
                })
                .collect();
            check_result(CHECK_PROCESSES, CheckStatus::Ok, detail, items, "")
        }
    }
}

fn smoke_check(
    env_report: &EnvironmentReport,
    launcher: Option<&dyn SmokeLauncher>,
    settings: &SmokeSettings,
    python: &str,
) -> CheckResult {
    let with_python = |mut result: CheckResult| {
        result.remediation = result
            .remediation
            .map(|text| text.replace("{context}", python));
        result
    };
    let missing = env_report.missing_packages();
    if !missing.is_empty() {
        return check_result(
            CHECK_SMOKE_TEST,
            CheckStatus::Skipped,
            format!("skipped: {} required packages missing", missing.len()),
            Vec::new(),
            "",
        );
    }
    let Some(launcher) = launcher else {
        return check_result(
            CHECK_SMOKE_TEST,
            CheckStatus::Skipped,
            "skipped: no interpreter to launch",
            Vec::new(),
            "",
        );
    };
    let port = match smoke::scratch_port() {
        Ok(port) => port,
        Err(err) => {
            return with_python(check_result(
                CHECK_SMOKE_TEST,
                CheckStatus::Error,
                format!("failed to reserve a scratch port: {err}"),
                Vec::new(),
                "",
            ));
        }
    };
    match smoke::run_smoke_test(launcher, port, settings) {
        Ok(detail) => check_result(CHECK_SMOKE_TEST, CheckStatus::Ok, detail, Vec::new(), ""),
        Err(err) => {
            tracing::warn!(port, error = %err, "smoke test failed");
            with_python(check_result(
                CHECK_SMOKE_TEST,
                CheckStatus::Error,
                err,
                Vec::new(),
                "",
            ))
        }
    }
}

fn counted(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("1 {noun}")
    } else {
        format!("{count} {noun}s")
    }
}

fn generic_solution_commands(python: &str) -> Vec<String> {
    let stop_stale = if cfg!(windows) {
        "taskkill /IM python.exe /F".to_string()
    } else {
        "pkill -f 'main.py --mode all'".to_string()
    };
    vec![
        format!("{python} -m pip install -r requirements.txt"),
        format!("{python} -m web.app"),
        format!("curl http://localhost:{API_PORT}/health"),
        stop_stale,
        format!("{python} main.py --mode all"),
    ]
}

/// Runs every check in order. Individual failures become check results;
/// nothing here aborts the run.
pub(crate) fn collect_report(root: &Path, deps: &DoctorDeps<'_>) -> DiagnosticReport {
    let env_report = probe_environment(deps.runner);
    let layout = check_layout(root, EXPECTED_PATHS);

    let checks = vec![
        runtime_check(&env_report),
        packages_check(&env_report, &deps.python_display),
        ports_check(deps.ports, deps.port_timeout),
        layout_check(&layout),
        config_files_check(root),
        processes_check(list_interpreter_processes(INTERPRETER_PROCESS_PATTERN)),
        smoke_check(&env_report, deps.launcher, &deps.smoke, &deps.python_display),
    ];

    let missing_packages: Vec<String> = env_report
        .missing_packages()
        .iter()
        .map(|package| package.pip_name.to_string())
        .collect();

    let mut solution_commands: Vec<String> = checks
        .iter()
        .filter_map(|check| check.remediation.clone())
        .collect();
    for command in generic_solution_commands(&deps.python_display) {
        if !solution_commands.contains(&command) {
            solution_commands.push(command);
        }
    }

    let mut summary = Vec::new();
    if missing_packages.is_empty() {
        summary.push("All packages installed".to_string());
    } else {
        summary.push(format!(
            "Missing {}",
            counted(missing_packages.len(), "package")
        ));
    }
    if layout.missing == 0 {
        summary.push("Project structure OK".to_string());
    } else {
        summary.push(format!("Missing {}", counted(layout.missing, "file")));
    }

    DiagnosticReport {
        generated_at: Utc::now().to_rfc3339(),
        root: root.to_path_buf(),
        checks,
        missing_packages,
        missing_paths: layout.missing,
        solution_commands,
        summary,
    }
}

fn status_label(status: CheckStatus) -> String {
    let label = format!("[{}]", status.as_str());
    match status {
        CheckStatus::Ok => style(label).green().to_string(),
        CheckStatus::Missing => style(label).yellow().to_string(),
        CheckStatus::Error => style(label).red().to_string(),
        CheckStatus::Skipped => style(label).dim().to_string(),
    }
}

pub(crate) fn render_report(report: &DiagnosticReport) -> String {
    let mut lines = Vec::new();
    lines.push(style("URLControl System Diagnostics").bold().cyan().to_string());
    lines.push(format!("Project root: {}", report.root.display()));
    lines.push(format!("Generated at: {}", report.generated_at));
    for check in &report.checks {
        lines.push(String::new());
        lines.push(format!(
            "{} {} - {}",
            status_label(check.status),
            style(&check.name).bold(),
            check.detail
        ));
        for entry in &check.items {
            lines.push(format!(
                "    {} {}: {}",
                status_label(entry.status),
                entry.label,
                entry.detail
            ));
        }
        if let Some(remediation) = &check.remediation {
            lines.push(format!("  remediation: {remediation}"));
        }
    }
    lines.push(String::new());
    lines.push(style("SOLUTION COMMANDS").bold().to_string());
    for (idx, command) in report.solution_commands.iter().enumerate() {
        lines.push(format!("  {}. {}", idx + 1, command));
    }
    lines.push(String::new());
    lines.push(style("SUMMARY").bold().to_string());
    for line in &report.summary {
        lines.push(format!("  {line}"));
    }
    lines.join("\n")
}

pub(crate) fn handle_doctor(ctx: &Context) -> Result<(), UrlctlError> {
    let runner = ctx.python.clone().map(PythonRunner::new);
    let launcher = ctx.python.clone().map(FlaskLauncher::new);
    let deps = DoctorDeps {
        runner: runner.as_ref().map(|r| r as &dyn InterpreterRunner),
        launcher: launcher.as_ref().map(|l| l as &dyn SmokeLauncher),
        ports: CANDIDATE_PORTS,
        port_timeout: PORT_TIMEOUT,
        smoke: SmokeSettings::default(),
        python_display: ctx.python_display(),
    };
    let report = collect_report(&ctx.root, &deps);
    tracing::info!(healthy = report.healthy(), "diagnostic run finished");

    if ctx.json {
        let payload = JsonResult {
            ok: report.healthy(),
            result: Some(&report),
            error: None,
        };
        return print_json(&payload);
    }
    println!("{}", render_report(&report));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::fs;
    use std::net::TcpListener;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockRunner {
        missing_modules: BTreeSet<&'static str>,
        identity: Option<&'static str>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl InterpreterRunner for MockRunner {
        fn run(&self, args: &[&str]) -> Result<CommandOutput, io::Error> {
            self.calls
                .borrow_mut()
                .push(args.iter().map(|arg| arg.to_string()).collect());
            let script = args.get(1).copied().unwrap_or_default();
            if script == IDENTITY_SCRIPT {
                return Ok(CommandOutput {
                    status_code: 0,
                    stdout: self.identity.unwrap_or_default().as_bytes().to_vec(),
                    stderr: Vec::new(),
                });
            }
            if let Some(module) = script.strip_prefix("import ") {
                if self.missing_modules.contains(module) {
                    return Ok(CommandOutput {
                        status_code: 1,
                        stdout: Vec::new(),
                        stderr: format!(
                            "Traceback (most recent call last):\nModuleNotFoundError: No module named '{module}'\n"
                        )
                        .into_bytes(),
                    });
                }
            }
            Ok(CommandOutput {
                status_code: 0,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }

        fn executable(&self) -> &Path {
            Path::new("/usr/bin/python3")
        }
    }

    struct PanicLauncher {
        launched: RefCell<bool>,
    }

    impl SmokeLauncher for PanicLauncher {
        fn launch(&self, _port: u16) -> Result<Box<dyn smoke::ScratchServer>, String> {
            *self.launched.borrow_mut() = true;
            Err("launch refused in tests".to_string())
        }
    }

    const VENV_IDENTITY: &str = r#"{"version": "3.11.4", "executable": "/srv/app/.venv/bin/python", "prefix": "/srv/app/.venv", "base_prefix": "/usr", "real_prefix": null}"#;
    const SYSTEM_IDENTITY: &str = r#"{"version": "3.10.12", "executable": "/usr/bin/python3", "prefix": "/usr", "base_prefix": "/usr", "real_prefix": null}"#;

    fn check<'r>(report: &'r DiagnosticReport, name: &str) -> &'r CheckResult {
        report
            .checks
            .iter()
            .find(|check| check.name == name)
            .unwrap_or_else(|| panic!("{name} check missing"))
    }

    fn deps<'a>(
        runner: Option<&'a dyn InterpreterRunner>,
        launcher: Option<&'a dyn SmokeLauncher>,
    ) -> DoctorDeps<'a> {
        DoctorDeps {
            runner,
            launcher,
            ports: &[],
            port_timeout: PORT_TIMEOUT,
            smoke: SmokeSettings {
                ready_timeout: Duration::from_millis(300),
                request_timeout: Duration::from_secs(1),
            },
            python_display: "python3".to_string(),
        }
    }

    #[test]
    fn identity_detects_virtual_environment() {
        let runner = MockRunner {
            identity: Some(VENV_IDENTITY),
            ..MockRunner::default()
        };
        let info = probe_identity(&runner).unwrap();
        assert_eq!(info.version, "3.11.4");
        assert!(info.isolated);

        let runner = MockRunner {
            identity: Some(SYSTEM_IDENTITY),
            ..MockRunner::default()
        };
        assert!(!probe_identity(&runner).unwrap().isolated);
    }

    #[test]
    fn import_failures_are_recorded_as_missing() {
        let runner = MockRunner {
            identity: Some(SYSTEM_IDENTITY),
            missing_modules: ["flask_socketio", "bs4"].into_iter().collect(),
            ..MockRunner::default()
        };
        let report = probe_environment(Some(&runner));
        let missing: Vec<&str> = report
            .missing_packages()
            .iter()
            .map(|package| package.pip_name)
            .collect();
        assert_eq!(missing, vec!["flask-socketio", "beautifulsoup4"]);
        let socketio = report
            .packages
            .iter()
            .find(|status| status.package.module == "flask_socketio")
            .unwrap();
        assert!(socketio.detail.contains("No module named 'flask_socketio'"));
        // one identity probe plus one import per package
        assert_eq!(runner.calls.borrow().len(), 1 + REQUIRED_PACKAGES.len());
    }

    #[test]
    fn missing_interpreter_marks_every_package_missing() {
        let report = probe_environment(None);
        assert!(report.runtime.is_err());
        assert_eq!(report.missing_packages().len(), REQUIRED_PACKAGES.len());
    }

    #[test]
    fn smoke_test_is_skipped_when_packages_are_missing() {
        let dir = tempdir().unwrap();
        let runner = MockRunner {
            identity: Some(SYSTEM_IDENTITY),
            missing_modules: ["flask"].into_iter().collect(),
            ..MockRunner::default()
        };
        let launcher = PanicLauncher {
            launched: RefCell::new(false),
        };
        let report = collect_report(dir.path(), &deps(Some(&runner), Some(&launcher)));
        let smoke = check(&report, CHECK_SMOKE_TEST);
        assert_eq!(smoke.status, CheckStatus::Skipped);
        assert!(!*launcher.launched.borrow());
        assert_eq!(report.summary[0], "Missing 1 package");
    }

    #[test]
    fn smoke_test_is_attempted_when_packages_are_present() {
        let dir = tempdir().unwrap();
        let runner = MockRunner {
            identity: Some(SYSTEM_IDENTITY),
            ..MockRunner::default()
        };
        let launcher = PanicLauncher {
            launched: RefCell::new(false),
        };
        let report = collect_report(dir.path(), &deps(Some(&runner), Some(&launcher)));
        let smoke = check(&report, CHECK_SMOKE_TEST);
        assert!(*launcher.launched.borrow());
        assert_eq!(smoke.status, CheckStatus::Error);
        assert!(smoke.detail.contains("launch refused"));
        assert_eq!(
            smoke.remediation.as_deref(),
            Some("start the dashboard manually to see the full traceback: python3 -m web.app")
        );
    }

    #[test]
    fn report_has_one_result_per_check_in_order() {
        let dir = tempdir().unwrap();
        let report = collect_report(dir.path(), &deps(None, None));
        let names: Vec<&str> = report.checks.iter().map(|check| check.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                CHECK_RUNTIME,
                CHECK_PACKAGES,
                CHECK_PORTS,
                CHECK_LAYOUT,
                CHECK_CONFIG_FILES,
                CHECK_PROCESSES,
                CHECK_SMOKE_TEST
            ]
        );
        let packages = check(&report, CHECK_PACKAGES);
        assert_eq!(packages.items.len(), REQUIRED_PACKAGES.len());
        assert_eq!(
            packages.remediation.as_deref(),
            Some("python3 -m pip install flask flask-cors flask-restful flask-socketio requests beautifulsoup4 colorama tqdm")
        );
        assert!(!report.healthy());
        assert!(report
            .solution_commands
            .contains(&format!("curl http://localhost:{API_PORT}/health")));
    }

    #[test]
    fn port_with_listener_is_occupied_and_free_port_is_available() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        assert_eq!(probe_port(busy, PORT_TIMEOUT), PortState::Occupied);

        let free = {
            let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            probe.local_addr().unwrap().port()
        };
        assert_eq!(probe_port(free, PORT_TIMEOUT), PortState::Available);
    }

    #[test]
    fn layout_counts_missing_paths() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("web")).unwrap();
        fs::write(root.join("web/app.py"), "").unwrap();
        fs::write(root.join("requirements.txt"), "flask\n").unwrap();
        fs::create_dir_all(root.join("config")).unwrap();
        // a file where a directory is expected does not count
        fs::write(root.join("logs"), "").unwrap();

        let layout = check_layout(root, EXPECTED_PATHS);
        let exists = layout
            .entries
            .iter()
            .filter(|(_, state)| *state == PathState::Exists)
            .count();
        assert_eq!(exists, 3);
        assert_eq!(layout.missing, EXPECTED_PATHS.len() - 3);
        assert_eq!(layout.entries.len(), EXPECTED_PATHS.len());
    }

    #[test]
    fn broken_json_config_is_an_error_with_remediation() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{\"web\": ").unwrap();
        let result = config_files_check(dir.path());
        assert_eq!(result.status, CheckStatus::Error);
        let entry = result
            .items
            .iter()
            .find(|entry| entry.label == "config.json")
            .unwrap();
        assert_eq!(entry.status, CheckStatus::Error);
        assert!(!entry.detail.is_empty());
        assert_eq!(
            result.remediation.as_deref(),
            Some("fix the syntax errors in config.json")
        );
    }

    #[test]
    fn summary_counts_are_pluralised() {
        assert_eq!(counted(1, "file"), "1 file");
        assert_eq!(counted(0, "file"), "0 files");
        assert_eq!(counted(6, "package"), "6 packages");

        let dir = tempdir().unwrap();
        let root = dir.path();
        for relative in EXPECTED_PATHS.iter().filter(|path| **path != "main.py") {
            let path = root.join(relative.trim_end_matches('/'));
            if relative.ends_with('/') {
                fs::create_dir_all(&path).unwrap();
            } else {
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, "").unwrap();
            }
        }
        let report = collect_report(root, &deps(None, None));
        assert_eq!(report.summary[1], "Missing 1 file");
    }

    #[test]
    fn unqueryable_interpreter_falls_back_to_virtual_env() {
        let items = fallback_runtime_items(Some("/srv/app/.venv".to_string()));
        assert_eq!(items[0].label, "isolated runtime");
        assert_eq!(items[0].detail, "active (VIRTUAL_ENV)");
        assert_eq!(items[1].detail, "/srv/app/.venv");

        let items = fallback_runtime_items(None);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].detail, "not active (VIRTUAL_ENV unset)");

        let report = EnvironmentReport {
            runtime: Err("no python interpreter found on PATH".to_string()),
            packages: Vec::new(),
        };
        let result = runtime_check(&report);
        assert_eq!(result.status, CheckStatus::Error);
        assert!(result
            .items
            .iter()
            .any(|entry| entry.label == "isolated runtime"));
    }

    #[test]
    fn unsupported_process_listing_is_skipped() {
        let result = processes_check(ProcessScan::Unsupported);
        assert_eq!(result.status, CheckStatus::Skipped);
        let result = processes_check(ProcessScan::Found(Vec::new()));
        assert_eq!(result.status, CheckStatus::Ok);
        assert_eq!(result.detail, "no python processes running");
    }

    #[test]
    fn rendered_report_lists_remediation_and_summary() {
        let dir = tempdir().unwrap();
        let report = collect_report(dir.path(), &deps(None, None));
        let text = render_report(&report);
        assert!(text.contains("SOLUTION COMMANDS"));
        assert!(text.contains("Missing 8 packages"));
        assert!(text.contains(&format!("Missing {} files", EXPECTED_PATHS.len())));
        assert!(text.contains("remediation: urlctl config init"));
    }
}
