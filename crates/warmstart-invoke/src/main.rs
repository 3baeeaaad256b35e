//! warmstart-invoke - ask warmstartd to launch a program
//!
//! Forwards the program, its arguments, this process's environment,
//! identity and stdio to the daemon, prints nothing on success and exits
//! with the launched program's status.

use anyhow::{Context, Result};
use clap::Parser;
use std::ffi::OsString;
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus};
use std::time::Duration;
use tracing::{debug, info};
use warmstart_api::Invocation;
use warmstart_ipc::InvokerClient;
use warmstart_util::{ReportOutput, default_socket_path, die, init_reporting};

/// warmstart-invoke - Launch a program through warmstartd
#[derive(Parser, Debug)]
#[command(name = "warmstart-invoke")]
#[command(about = "Launch a program through warmstartd", long_about = None)]
struct Args {
    /// Launcher socket (or set WARMSTART_SOCKET env var)
    #[arg(short, long, env = "WARMSTART_SOCKET", default_value_os_t = default_socket_path())]
    socket: PathBuf,

    /// Return as soon as the program has started
    #[arg(short = 'n', long)]
    detach: bool,

    /// Nice value for the launched program
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    priority: i32,

    /// Seconds a booster waits before getting ready again
    #[arg(short, long, default_value_t = 0)]
    delay: u32,

    /// Application name reported to the daemon
    #[arg(short, long)]
    app_name: Option<String>,

    /// Give up waiting on the daemon after this many seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Log level
    #[arg(short, long, default_value = "warn")]
    log_level: String,

    /// Program to launch
    program: PathBuf,

    /// Arguments for the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn build_invocation(args: &Args, uid: u32, gid: u32, env: Vec<OsString>) -> Invocation {
    let argv = std::iter::once(args.program.clone().into_os_string()).chain(args.args.iter().cloned());

    let mut invocation = Invocation::new(&args.program, uid, gid)
        .with_args(argv)
        .with_env(env)
        .with_priority(args.priority)
        .with_respawn_delay(args.delay)
        .detached(args.detach);

    if let Some(name) = &args.app_name {
        invocation = invocation.with_app_name(name.clone());
    }
    invocation
}

/// `KEY=VALUE` entries for every variable of this process
fn current_environment() -> Vec<OsString> {
    std::env::vars_os()
        .map(|(key, value)| {
            let mut entry = key.into_vec();
            entry.push(b'=');
            entry.extend(value.into_vec());
            OsString::from_vec(entry)
        })
        .collect()
}

/// Shell-style exit code for a raw wait status
fn exit_code(status: i32) -> u8 {
    let status = ExitStatus::from_raw(status);
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u8,
        (None, Some(signal)) => 128u8.wrapping_add(signal as u8),
        (None, None) => 1,
    }
}

fn run(args: &Args) -> Result<ExitCode> {
    let invocation = build_invocation(
        args,
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
        current_environment(),
    );

    let mut client = InvokerClient::connect(&args.socket)
        .with_context(|| format!("Failed to connect to {:?}", args.socket))?;
    client.set_receive_timeout(args.timeout.map(Duration::from_secs))?;

    let (stdin, stdout, stderr) = (std::io::stdin(), std::io::stdout(), std::io::stderr());
    client
        .send(&invocation, [stdin.as_fd(), stdout.as_fd(), stderr.as_fd()])
        .context("Failed to send launch request")?;

    let pid = client.recv_pid().context("No pid from warmstartd")?;
    info!(pid = pid, program = %args.program.display(), "Launched");

    if args.detach {
        return Ok(ExitCode::SUCCESS);
    }

    let status = client
        .recv_exit_status()
        .context("No exit status from warmstartd")?;
    debug!(pid = pid, status = status, "Program exited");

    Ok(ExitCode::from(exit_code(status)))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_reporting("warmstart-invoke", ReportOutput::Console, &args.log_level);

    match run(&args) {
        Ok(code) => code,
        Err(e) => die(1, format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_after_program_are_passed_through() {
        let args = Args::parse_from([
            "warmstart-invoke",
            "--priority",
            "-5",
            "-n",
            "/usr/bin/app",
            "--fullscreen",
            "-v",
        ]);

        let invocation = build_invocation(&args, 1000, 100, vec!["LANG=C".into()]);
        assert_eq!(invocation.exec, PathBuf::from("/usr/bin/app"));
        assert_eq!(
            invocation.args,
            vec![
                OsString::from("/usr/bin/app"),
                OsString::from("--fullscreen"),
                OsString::from("-v"),
            ]
        );
        assert_eq!(invocation.priority, -5);
        assert!(invocation.detach);
        assert_eq!((invocation.uid, invocation.gid), (1000, 100));
        assert_eq!(invocation.env, vec![OsString::from("LANG=C")]);
    }

    #[test]
    fn app_name_and_delay() {
        let args = Args::parse_from(["warmstart-invoke", "-a", "viewer", "-d", "4", "/usr/bin/viewer"]);
        let invocation = build_invocation(&args, 0, 0, Vec::new());
        assert_eq!(invocation.app_name.as_deref(), Some("viewer"));
        assert_eq!(invocation.respawn_delay, 4);
        assert!(!invocation.detach);
    }

    #[test]
    fn exit_codes_follow_shell_conventions() {
        assert_eq!(exit_code(0), 0);
        assert_eq!(exit_code(3 << 8), 3);
        // Killed by SIGKILL
        assert_eq!(exit_code(9), 137);
    }

    #[test]
    fn environment_entries_are_key_value() {
        let env = current_environment();
        assert!(env.iter().all(|e| e.as_encoded_bytes().contains(&b'=')));
    }
}
