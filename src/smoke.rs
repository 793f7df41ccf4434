//! End-to-end check that the dashboard's web framework can start and answer
//! one request on a scratch port.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const HEALTH_PATH: &str = "/test";

const FLASK_SMOKE_APP: &str = r#"import sys
from flask import Flask

app = Flask("urlctl_smoke")


@app.route("/test")
def test():
    return {"status": "ok", "message": "Flask is working"}


app.run(host="127.0.0.1", port=int(sys.argv[1]), debug=False, use_reloader=False)
"#;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub(crate) struct SmokeSettings {
    pub(crate) ready_timeout: Duration,
    pub(crate) request_timeout: Duration,
}

impl Default for SmokeSettings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// A listener started for the duration of one smoke test.
pub(crate) trait ScratchServer {
    /// Returns a message once the server has exited on its own.
    fn exited(&mut self) -> Option<String>;
    fn shutdown(&mut self) -> io::Result<()>;
}

pub(crate) trait SmokeLauncher {
    fn launch(&self, port: u16) -> Result<Box<dyn ScratchServer>, String>;
}

pub(crate) struct FlaskLauncher {
    python: PathBuf,
}

impl FlaskLauncher {
    pub(crate) fn new(python: PathBuf) -> Self {
        Self { python }
    }
}

struct ChildServer {
    child: Child,
}

impl ScratchServer for ChildServer {
    fn exited(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(format!("scratch server exited early ({status})")),
            Ok(None) => None,
            Err(err) => Some(format!("failed to poll scratch server: {err}")),
        }
    }

    fn shutdown(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_none() {
            self.child.kill()?;
        }
        self.child.wait()?;
        Ok(())
    }
}

impl SmokeLauncher for FlaskLauncher {
    fn launch(&self, port: u16) -> Result<Box<dyn ScratchServer>, String> {
        let child = Command::new(&self.python)
            .arg("-c")
            .arg(FLASK_SMOKE_APP)
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| format!("failed to start {}: {err}", self.python.display()))?;
        tracing::debug!(pid = child.id(), port, "started scratch flask server");
        Ok(Box::new(ChildServer { child }))
    }
}

/// Asks the OS for a free loopback port.
pub(crate) fn scratch_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Spawns a watcher that signals once `addr` accepts connections.
fn watch_for_listener(addr: SocketAddr, timeout: Duration) -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if TcpStream::connect_timeout(&addr, POLL_INTERVAL).is_ok() {
                let _ = tx.send(());
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
    });
    rx
}

fn wait_until_ready(
    server: &mut dyn ScratchServer,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<(), String> {
    let ready = watch_for_listener(addr, timeout);
    let deadline = Instant::now() + timeout;
    loop {
        match ready.recv_timeout(POLL_INTERVAL) {
            Ok(()) => return Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                if let Some(message) = server.exited() {
                    return Err(message);
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Err(format!(
        "scratch server did not accept connections on {addr} within {}s",
        timeout.as_secs_f32()
    ))
}

fn probe_health(addr: SocketAddr, timeout: Duration) -> Result<String, String> {
    let url = format!("http://{addr}{HEALTH_PATH}");
    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| err.to_string())?;
    let response = client.get(&url).send().map_err(|err| err.to_string())?;
    let status = response.status();
    if status == reqwest::StatusCode::OK {
        Ok(format!("GET {url} returned {status}"))
    } else {
        Err(format!("GET {url} returned {status}"))
    }
}

/// Starts a scratch server, waits for it to bind and issues one GET.
/// The server is always shut down before returning.
pub(crate) fn run_smoke_test(
    launcher: &dyn SmokeLauncher,
    port: u16,
    settings: &SmokeSettings,
) -> Result<String, String> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let mut server = launcher.launch(port)?;
    let result = wait_until_ready(server.as_mut(), addr, settings.ready_timeout)
        .and_then(|()| probe_health(addr, settings.request_timeout));
    if let Err(err) = server.shutdown() {
        tracing::warn!(error = %err, "failed to stop scratch server");
    }
    result
}
