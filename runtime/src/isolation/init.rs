//! The `init` stage of the re-exec protocol.
//!
//! Runs as `<exe> init` in a fresh process:
//!
//! 1. unshare the requested namespaces and report ready
//! 2. wait for the parent's go byte (cgroup join and ID maps happen meanwhile)
//! 3. set the hostname and make mount propagation private
//! 4. fork; the child (PID 1 of a new PID namespace) mounts, chroots and
//!    execs the target while this process relays logs and signals and
//!    exits with the child's status
//!
//! This must run before any threads are started.

use a3s_ctr_core::error::Result;

use super::protocol::InitSpec;

/// Exit status when the target program cannot be executed.
pub const EXEC_FAILED: i32 = 127;

/// Entry point for the hidden `init` subcommand. Returns the exit code.
pub fn run_init() -> i32 {
    let spec = match InitSpec::from_env() {
        Ok(spec) => spec,
        Err(e) => {
            tracing::error!(error = %e, "Invalid init stage environment");
            return 1;
        }
    };
    match run(spec) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Init stage failed");
            1
        }
    }
}

#[cfg(target_os = "linux")]
fn run(spec: InitSpec) -> Result<i32> {
    imp::run(spec)
}

#[cfg(not(target_os = "linux"))]
fn run(_spec: InitSpec) -> Result<i32> {
    Err(a3s_ctr_core::error::CtrError::unsupported(
        "namespaces",
        "only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
mod imp {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::os::unix::process::CommandExt;
    use std::sync::atomic::{AtomicI32, Ordering};

    use a3s_ctr_core::error::{CtrError, Result};
    use nix::errno::Errno;
    use nix::sched::unshare;
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult, Gid, Pid, Uid};

    use super::super::logs::{log_paths, open_log, pump};
    use super::super::protocol::{InitSpec, GO_BYTE};
    use super::EXEC_FAILED;
    use crate::rootfs::mounts::{bind_mount, enter_chroot, make_mounts_private, setup_mounts};

    /// PID of the container child, read by the signal handler.
    static CHILD_PID: AtomicI32 = AtomicI32::new(0);

    extern "C" fn forward_signal(sig: libc::c_int) {
        let pid = CHILD_PID.load(Ordering::SeqCst);
        if pid > 0 {
            // SAFETY: kill is async-signal-safe.
            unsafe {
                libc::kill(pid, sig);
            }
        }
    }

    fn ns_err(what: &str, e: impl std::fmt::Display) -> CtrError {
        CtrError::NamespaceError(format!("{}: {}", what, e))
    }

    fn set_cloexec(fd: RawFd) {
        // SAFETY: plain fcntl on an fd we own.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }

    pub(super) fn run(spec: InitSpec) -> Result<i32> {
        // SAFETY: the parent placed these descriptors in our environment and
        // nothing else in this process owns them.
        let sync = unsafe { OwnedFd::from_raw_fd(spec.sync_fd) };
        let ready = unsafe { OwnedFd::from_raw_fd(spec.ready_fd) };
        set_cloexec(sync.as_raw_fd());
        set_cloexec(ready.as_raw_fd());

        if !spec.namespaces.is_empty() {
            unshare(spec.namespaces.clone_flags()).map_err(|e| ns_err("unshare failed", e))?;
        }

        let mut ready = File::from(ready);
        ready
            .write_all(&[GO_BYTE])
            .map_err(|e| ns_err("failed to signal readiness", e))?;
        drop(ready);

        let mut go = [0u8; 1];
        let mut sync = File::from(sync);
        match sync.read(&mut go) {
            Ok(1) if go[0] == GO_BYTE => {}
            Ok(_) => {
                return Err(CtrError::NamespaceError(
                    "parent closed the sync pipe before release".to_string(),
                ))
            }
            Err(e) => return Err(ns_err("failed to read sync pipe", e)),
        }
        drop(sync);

        if spec.namespaces.user {
            if let Err(e) = nix::unistd::setgid(Gid::from_raw(0))
                .and_then(|_| nix::unistd::setuid(Uid::from_raw(0)))
            {
                tracing::warn!(error = %e, "Failed to become root in user namespace");
            }
        }

        if spec.namespaces.uts {
            if let Some(hostname) = &spec.hostname {
                nix::unistd::sethostname(hostname)
                    .map_err(|e| ns_err("failed to set hostname", e))?;
            }
        }

        if spec.namespaces.mount {
            make_mounts_private()?;
        }

        let logs = match &spec.log_dir {
            Some(dir) => Some(LogPipes::open(dir)?),
            None => None,
        };

        // SAFETY: no threads have been started in this process.
        match unsafe { fork() }.map_err(|e| ns_err("fork failed", e))? {
            ForkResult::Child => {
                let code = match container_main(&spec, logs.as_ref()) {
                    Ok(never) => match never {},
                    Err(e) => {
                        tracing::error!(error = %e, "Container setup failed");
                        EXEC_FAILED
                    }
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => supervise(child, logs, spec.namespaces.pid),
        }
    }

    struct LogPipes {
        stdout: (OwnedFd, OwnedFd),
        stderr: (OwnedFd, OwnedFd),
        files: (File, File),
    }

    impl LogPipes {
        fn open(dir: &std::path::Path) -> Result<Self> {
            let (out_path, err_path) = log_paths(dir);
            let pipe = || nix::unistd::pipe().map_err(|e| ns_err("failed to create log pipe", e));
            Ok(Self {
                stdout: pipe()?,
                stderr: pipe()?,
                files: (open_log(&out_path)?, open_log(&err_path)?),
            })
        }
    }

    enum Never {}

    /// Runs in the forked child: finish the root and exec the target.
    fn container_main(spec: &InitSpec, logs: Option<&LogPipes>) -> Result<Never> {
        if let Some(logs) = logs {
            // SAFETY: dup2 onto the standard descriptors.
            unsafe {
                libc::dup2(logs.stdout.1.as_raw_fd(), libc::STDOUT_FILENO);
                libc::dup2(logs.stderr.1.as_raw_fd(), libc::STDERR_FILENO);
            }
            for fd in [&logs.stdout.0, &logs.stdout.1, &logs.stderr.0, &logs.stderr.1] {
                set_cloexec(fd.as_raw_fd());
            }
            set_cloexec(logs.files.0.as_raw_fd());
            set_cloexec(logs.files.1.as_raw_fd());
        }

        if spec.namespaces.mount {
            let failed = setup_mounts(&spec.rootfs);
            if !failed.is_empty() {
                tracing::warn!(failed = ?failed, "Some container mounts failed");
            }
            for bind in &spec.binds {
                bind_mount(&spec.rootfs, bind)?;
            }
        } else if !spec.binds.is_empty() {
            tracing::warn!(count = spec.binds.len(), "Bind mounts skipped without a mount namespace");
        }

        enter_chroot(&spec.rootfs)?;
        if let Err(e) = std::env::set_current_dir(&spec.work_dir) {
            tracing::warn!(work_dir = %spec.work_dir, error = %e, "Failed to enter working directory");
        }

        if spec.no_new_privs {
            // SAFETY: prctl with constant arguments.
            let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
            if rc != 0 {
                return Err(ns_err("failed to set no_new_privs", std::io::Error::last_os_error()));
            }
        }

        let err = std::process::Command::new(&spec.argv[0])
            .args(&spec.argv[1..])
            .env_clear()
            .envs(&spec.env)
            .exec();
        Err(CtrError::NamespaceError(format!(
            "failed to execute {}: {}",
            spec.argv[0], err
        )))
    }

    /// Relay logs and signals until the child exits; return its status.
    fn supervise(child: Pid, logs: Option<LogPipes>, pid_namespace: bool) -> Result<i32> {
        CHILD_PID.store(child.as_raw(), Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only reads an atomic and calls kill.
            if let Err(e) = unsafe { sigaction(signal, &action) } {
                tracing::warn!(?signal, error = %e, "Failed to install signal forwarder");
            }
        }

        let mut pumps = Vec::new();
        if let Some(LogPipes {
            stdout,
            stderr,
            files,
        }) = logs
        {
            let (out_read, out_write) = stdout;
            let (err_read, err_write) = stderr;
            drop(out_write);
            drop(err_write);
            for (read, file) in [(out_read, files.0), (err_read, files.1)] {
                pumps.push(std::thread::spawn(move || {
                    if let Err(e) = pump(File::from(read), file) {
                        tracing::warn!(error = %e, "Log relay failed");
                    }
                }));
            }
        }

        let code = loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => break code,
                Ok(WaitStatus::Signaled(_, signal, _)) => break 128 + signal as i32,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(e) => return Err(ns_err("waitpid failed", e)),
            }
        };

        // With a PID namespace every process holding the pipes is gone once
        // PID 1 exits; otherwise background descendants may keep them open.
        if pid_namespace {
            for handle in pumps {
                let _ = handle.join();
            }
        }
        Ok(code)
    }
}
