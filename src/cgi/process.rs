use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// CPU seconds a script may consume.
pub const CPU_LIMIT_SECS: libc::rlim_t = 60;
/// Address space a script may map.
pub const MEMORY_LIMIT_BYTES: libc::rlim_t = 50 * 1024 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(super) enum Exit {
    Finished {
        status: ExitStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    TimedOut,
}

/// Runs `program` inside `dir` with exactly `env`, feeding it `input` and
/// collecting its output until it exits or `timeout` passes. A child that
/// outlives the deadline is killed and reaped.
pub(super) fn run(
    program: &str,
    args: &[&str],
    dir: &Path,
    env: &[(String, String)],
    input: &[u8],
    timeout: Duration,
) -> io::Result<Exit> {
    let mut command = Command::new(program);
    command
        .args(args)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k, v)))
        .current_dir(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: only async-signal-safe calls between fork and exec.
    unsafe {
        command.pre_exec(|| {
            limit_resources();
            Ok(())
        });
    }

    let mut child = command.spawn()?;
    let result = supervise(&mut child, input, timeout);
    finish(&mut child, result)
}

/// Feeds stdin and collects output until the child exits or the deadline
/// passes.
fn supervise(child: &mut Child, input: &[u8], timeout: Duration) -> io::Result<Exit> {
    let stdin = child.stdin.take();
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stderr not captured"))?;
    set_nonblocking(stdout.as_raw_fd())?;
    set_nonblocking(stderr.as_raw_fd())?;

    let deadline = Instant::now() + timeout;
    let mut out = Vec::new();
    let mut err = Vec::new();

    thread::scope(|scope| -> io::Result<Exit> {
        if let Some(mut stdin) = stdin {
            // Dropping the pipe at the end signals EOF to the script. A script
            // that exits without reading turns the write into EPIPE.
            scope.spawn(move || {
                let _ = stdin.write_all(input);
            });
        }

        let mut collect = || -> io::Result<Exit> {
            loop {
                drain(&mut stdout, &mut out)?;
                drain(&mut stderr, &mut err)?;

                if let Some(status) = child.try_wait()? {
                    drain(&mut stdout, &mut out)?;
                    drain(&mut stderr, &mut err)?;
                    return Ok(Exit::Finished {
                        status,
                        stdout: std::mem::take(&mut out),
                        stderr: std::mem::take(&mut err),
                    });
                }

                if Instant::now() >= deadline {
                    reap(child);
                    return Ok(Exit::TimedOut);
                }
                thread::sleep(POLL_INTERVAL);
            }
        };
        // The stdin writer is joined when the scope ends. It only returns once
        // the child is gone or has read everything.
        let result = collect();
        if result.is_err() {
            reap(child);
        }
        result
    })
}

/// Kills and reaps `child` when `result` is an error.
fn finish<T>(child: &mut Child, result: io::Result<T>) -> io::Result<T> {
    if result.is_err() {
        reap(child);
    }
    result
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn limit_resources() {
    let cpu = libc::rlimit {
        rlim_cur: CPU_LIMIT_SECS,
        rlim_max: CPU_LIMIT_SECS,
    };
    let memory = libc::rlimit {
        rlim_cur: MEMORY_LIMIT_BYTES,
        rlim_max: MEMORY_LIMIT_BYTES,
    };
    // Failure leaves the inherited, already lower, limit in place.
    unsafe {
        libc::setrlimit(libc::RLIMIT_CPU, &cpu);
        libc::setrlimit(libc::RLIMIT_AS, &memory);
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Reads whatever is available without blocking.
fn drain<R: Read>(source: &mut R, sink: &mut Vec<u8>) -> io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        match source.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => sink.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
