//! Sample meter: an IEC 62056-21 mode C server behind a serial proxy.
//!
//! Spawns the proxy as a child process (re-executing this binary with the
//! hidden `proxy` subcommand), receives the server-side device path over
//! the child's stdout, and serves ME162-flavoured registers on it. The
//! client-side device is advertised as a symlink for the polling client
//! to pick up.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use me162_pub::iec62056::server::{Me162DataProvider, ModeCServer, ServerRunner};
use me162_pub::serial::SerialProxy;
use me162_pub::{Error, Result};

#[derive(Parser)]
#[command(version, about = "IEC 62056-21 mode C sample server")]
struct Args {
    /// Path of the advertised client-side device symlink.
    #[arg(long, default_value = "./me162-sample-server.sock")]
    link: PathBuf,

    #[command(subcommand)]
    command: Option<Role>,
}

#[derive(Subcommand)]
enum Role {
    /// Internal: the serial proxy child process.
    #[command(hide = true)]
    Proxy { link: PathBuf },
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: i32) {
    STOP.store(true, Ordering::Relaxed);
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Some(Role::Proxy { link }) => run_proxy(&link),
        None => run_server(&args.link).await,
    }
}

/// Child role: create the pseudo-terminal pair, report the server-side
/// path on stdout, forward until a peer disconnects or SIGINT arrives.
fn run_proxy(link: &Path) -> Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet};

    let mut proxy = SerialProxy::exposed(link)?;
    log::info!(
        "Running proxy {} on {} ({})",
        std::process::id(),
        link.display(),
        proxy.b_dev().display()
    );

    println!("{}", proxy.a_dev().display());
    use std::io::Write;
    std::io::stdout().flush()?;

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }

    let result = proxy.run(&STOP);
    log::info!("Stopped proxy");
    result
}

/// Parent role: spawn the proxy child and serve on the device it reports.
async fn run_server(link: &Path) -> Result<()> {
    if link.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("{} exists; is another server running?", link.display()),
        )));
    }

    let exe = std::env::current_exe()?;
    let mut child = Command::new(exe)
        .arg("proxy")
        .arg(link)
        .stdout(Stdio::piped())
        .spawn()?;

    let adev = match read_device_path(&mut child).await {
        Ok(adev) => adev,
        Err(e) => {
            shutdown_child(&mut child).await;
            return Err(e);
        }
    };
    log::info!(
        "Parent {} connects to {}, clients to {}",
        std::process::id(),
        adev,
        link.display()
    );

    let result = serve(&adev, &mut child).await;
    shutdown_child(&mut child).await;
    result
}

async fn read_device_path(child: &mut Child) -> Result<String> {
    let stdout = child.stdout.take().ok_or_else(|| {
        Error::Io(std::io::Error::other("proxy child has no stdout"))
    })?;
    let mut lines = BufReader::new(stdout).lines();
    lines
        .next_line()
        .await?
        .filter(|line| !line.is_empty())
        .ok_or_else(|| Error::Io(std::io::Error::other("proxy child reported no device")))
}

async fn serve(adev: &str, child: &mut Child) -> Result<()> {
    let mut machine = ModeCServer::new(Me162DataProvider::sample());
    let mut runner = ServerRunner::open(adev)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_server = Arc::clone(&stop);
    let mut server_task =
        tokio::task::spawn_blocking(move || runner.run(&mut machine, &stop_server, || Ok(())));

    let mut child_exit: Option<i32> = None;
    let result = tokio::select! {
        joined = &mut server_task => Some(joined.expect("server thread panicked")),
        status = child.wait() => {
            let code = status.map(|s| s.code().unwrap_or(-1)).unwrap_or(-1);
            log::error!("Proxy child exited with status {}", code);
            child_exit = Some(code);
            None
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Got SIGINT");
            None
        }
    };

    stop.store(true, Ordering::Relaxed);
    let result = match result {
        Some(result) => result,
        None => server_task.await.expect("server thread panicked"),
    };

    match child_exit {
        Some(code) => Err(Error::ChildExited(code)),
        None => result,
    }
}

/// Ask the child nicely, then reap it.
async fn shutdown_child(child: &mut Child) {
    if let Some(id) = child.id() {
        log::info!("Asking proxy child to stop");
        let _ = kill(Pid::from_raw(id as i32), Signal::SIGINT);
    }
    let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
    let _ = child.start_kill();
}
