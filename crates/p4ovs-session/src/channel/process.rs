use std::collections::BTreeSet;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{take_through, CommandChannel, Credentials};
use crate::error::{Result, SessionError};

/// How a process-backed channel turns a command line into a child process.
#[derive(Debug, Clone)]
pub enum Launcher {
    /// `sh -c <command>` on the local host.
    Shell,
    /// `ssh user@host <command>`, through `sshpass -e` when a password is
    /// set. The password travels in `SSHPASS`, never on the command line.
    Ssh {
        host: String,
        port: u16,
        credentials: Option<Credentials>,
        connect_timeout: Duration,
    },
}

impl Launcher {
    pub fn peer(&self) -> String {
        match self {
            Launcher::Shell => "localhost".into(),
            Launcher::Ssh { host, .. } => host.clone(),
        }
    }

    /// Password handed to `sshpass` through the `SSHPASS` variable.
    pub fn password(&self) -> Option<&str> {
        match self {
            Launcher::Shell => None,
            Launcher::Ssh { credentials, .. } => credentials
                .as_ref()
                .map(|c| c.password.as_str())
                .filter(|p| !p.is_empty()),
        }
    }

    /// Full argv for running `command` through this launcher.
    pub fn argv(&self, command: &str) -> Vec<String> {
        let password = self.password();
        match self {
            Launcher::Shell => vec!["sh".into(), "-c".into(), command.into()],
            Launcher::Ssh {
                host,
                port,
                credentials,
                connect_timeout,
            } => {
                let mut argv: Vec<String> = Vec::new();
                if password.is_some() {
                    argv.extend(["sshpass".into(), "-e".into()]);
                }
                argv.push("ssh".into());
                for opt in [
                    "StrictHostKeyChecking=no",
                    "UserKnownHostsFile=/dev/null",
                    "LogLevel=ERROR",
                ] {
                    argv.push("-o".into());
                    argv.push(opt.into());
                }
                if password.is_none() {
                    argv.extend(["-o".into(), "BatchMode=yes".into()]);
                }
                argv.push("-o".into());
                argv.push(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)));
                argv.push("-p".into());
                argv.push(port.to_string());
                let target = match credentials {
                    Some(c) if !c.username.is_empty() => format!("{}@{}", c.username, host),
                    _ => host.clone(),
                };
                argv.push(target);
                argv.push(command.into());
                argv
            }
        }
    }
}

enum Chunk {
    Data(Vec<u8>),
    /// Child `seq` finished; `true` on a zero exit status.
    Exited { seq: u64, ok: bool },
}

/// Lock a child handle, recovering from poison.
fn lock_or_recover(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

/// Channel that runs each command as a child process.
///
/// Output of every child (stdout and stderr interleaved) is pumped by
/// reader threads into one queue, so reads honour their timeouts even when
/// a command never finishes. A command sent while an earlier one is still
/// running shares the output stream with it, like jobs on one terminal.
///
/// Every child gets a sequence number. `read_result` waits for and judges
/// only the children spawned since the previous `read_result`; a command
/// left running by an earlier timed-out read neither delays nor fails
/// later ones.
pub struct ProcessChannel {
    peer: String,
    launcher: Launcher,
    tx: Sender<Chunk>,
    rx: Receiver<Chunk>,
    buffer: Vec<u8>,
    next_seq: u64,
    /// First sequence number of the batch the next `read_result` judges.
    batch_start: u64,
    outstanding: BTreeSet<u64>,
    batch_ok: bool,
    last_ok: bool,
    children: Vec<Arc<Mutex<Child>>>,
    closed: bool,
}

impl ProcessChannel {
    pub fn new(launcher: Launcher) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            peer: launcher.peer(),
            launcher,
            tx,
            rx,
            buffer: Vec::new(),
            next_seq: 0,
            batch_start: 0,
            outstanding: BTreeSet::new(),
            batch_ok: true,
            last_ok: true,
            children: Vec::new(),
            closed: false,
        }
    }

    pub fn local() -> Self {
        Self::new(Launcher::Shell)
    }

    /// Number of commands that have not exited yet.
    pub fn running(&self) -> usize {
        self.outstanding.len()
    }

    fn batch_running(&self) -> bool {
        self.outstanding.range(self.batch_start..).next().is_some()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SessionError::lost(&self.peer, "channel closed"));
        }
        Ok(())
    }

    fn absorb(&mut self, chunk: Chunk) {
        match chunk {
            Chunk::Data(bytes) => self.buffer.extend_from_slice(&bytes),
            Chunk::Exited { seq, ok } => {
                self.outstanding.remove(&seq);
                if seq >= self.batch_start {
                    self.batch_ok &= ok;
                } else {
                    tracing::debug!(peer = %self.peer, seq, ok, "earlier command exited");
                }
            }
        }
    }

    fn drain(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.absorb(chunk);
        }
    }

    /// Wait for one more chunk. Returns `false` once the deadline passes.
    fn wait_chunk(&mut self, deadline: Instant) -> Result<bool> {
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        match self.rx.recv_timeout(deadline - now) {
            Ok(chunk) => {
                self.absorb(chunk);
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(SessionError::lost(&self.peer, "output queue disconnected"))
            }
        }
    }

    fn take_all(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned()
    }
}

impl CommandChannel for ProcessChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.ensure_open()?;
        let argv = self.launcher.argv(command);
        tracing::debug!(peer = %self.peer, %command, "spawning command");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(password) = self.launcher.password() {
            cmd.env("SSHPASS", password);
        }
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SessionError::Spawn {
                command: command.to_string(),
                source,
            })?;

        self.buffer.extend_from_slice(command.as_bytes());
        self.buffer.push(b'\n');

        let pumps: Vec<_> = [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        .map(|pipe| {
            let tx = self.tx.clone();
            thread::spawn(move || pump(pipe, tx))
        })
        .collect();

        let seq = self.next_seq;
        self.next_seq += 1;
        let child = Arc::new(Mutex::new(child));
        self.children.push(child.clone());
        self.outstanding.insert(seq);

        let tx = self.tx.clone();
        thread::spawn(move || {
            let ok = loop {
                match lock_or_recover(&child).try_wait() {
                    Ok(Some(status)) => break status.success(),
                    Ok(None) => {}
                    Err(_) => break false,
                }
                thread::sleep(Duration::from_millis(10));
            };
            for pump in pumps {
                let _ = pump.join();
            }
            let _ = tx.send(Chunk::Exited { seq, ok });
        });

        Ok(())
    }

    fn read_result(&mut self, timeout: Duration) -> Result<String> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        self.drain();
        while self.batch_running() {
            if !self.wait_chunk(deadline)? {
                tracing::debug!(peer = %self.peer, running = self.outstanding.len(), "read timed out with commands still running");
                break;
            }
        }
        self.drain();
        self.last_ok = self.batch_ok && !self.batch_running();
        self.batch_ok = true;
        self.batch_start = self.next_seq;
        Ok(self.take_all())
    }

    fn read_until(&mut self, marker: &str, timeout: Duration) -> Result<String> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            self.drain();
            if let Some(head) = take_through(&mut self.buffer, marker.as_bytes()) {
                return Ok(String::from_utf8_lossy(&head).into_owned());
            }
            if self.outstanding.is_empty() {
                if self.buffer.is_empty() {
                    return Err(SessionError::lost(&self.peer, "output stream ended"));
                }
                return Ok(self.take_all());
            }
            if !self.wait_chunk(deadline)? {
                return Ok(self.take_all());
            }
        }
    }

    fn last_command_succeeded(&self) -> bool {
        self.last_ok
    }

    fn close(&mut self) -> Result<()> {
        for child in self.children.drain(..) {
            let mut child = lock_or_recover(&child);
            if let Ok(None) = child.try_wait() {
                let _ = child.kill();
            }
        }
        self.closed = true;
        Ok(())
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn pump(mut pipe: Box<dyn Read + Send>, tx: Sender<Chunk>) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(Chunk::Data(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_argv_uses_sshpass_with_password() {
        let launcher = Launcher::Ssh {
            host: "10.0.0.2".into(),
            port: 22,
            credentials: Some(Credentials::new("root", "pw")),
            connect_timeout: Duration::from_secs(5),
        };
        let argv = launcher.argv("ip netns");
        assert_eq!(&argv[..3], ["sshpass", "-e", "ssh"]);
        assert!(!argv.contains(&"pw".to_string()));
        assert_eq!(launcher.password(), Some("pw"));
        assert!(argv.contains(&"ConnectTimeout=5".to_string()));
        assert!(!argv.contains(&"BatchMode=yes".to_string()));
        assert_eq!(argv[argv.len() - 2], "root@10.0.0.2");
        assert_eq!(argv[argv.len() - 1], "ip netns");
    }

    #[test]
    fn ssh_argv_without_password_is_batch_mode() {
        let launcher = Launcher::Ssh {
            host: "remote".into(),
            port: 2222,
            credentials: None,
            connect_timeout: Duration::from_millis(100),
        };
        let argv = launcher.argv("true");
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"BatchMode=yes".to_string()));
        assert!(argv.contains(&"ConnectTimeout=1".to_string()));
        assert!(argv.contains(&"2222".to_string()));
        assert_eq!(argv[argv.len() - 2], "remote");
    }

    #[test]
    fn local_command_output_is_echoed_and_collected() {
        let mut ch = ProcessChannel::local();
        let res = ch
            .execute("echo hello; echo oops >&2", Duration::from_secs(5))
            .unwrap();
        assert!(res.success());
        assert!(res.output().starts_with("echo hello; echo oops >&2\n"));
        assert!(res.output().contains("hello\n"));
        assert!(res.output().contains("oops\n"));
    }

    #[test]
    fn failing_command_reports_failure() {
        let mut ch = ProcessChannel::local();
        let res = ch.execute("exit 3", Duration::from_secs(5)).unwrap();
        assert!(!res.success());
    }

    #[test]
    fn slow_command_times_out_without_hanging() {
        let mut ch = ProcessChannel::local();
        let started = Instant::now();
        let res = ch.execute("sleep 5", Duration::from_millis(200)).unwrap();
        assert!(!res.success());
        assert!(started.elapsed() < Duration::from_secs(3));
        ch.close().unwrap();
    }

    #[test]
    fn timed_out_command_does_not_leak_into_next_result() {
        let mut ch = ProcessChannel::local();
        let res = ch.execute("sleep 1; exit 1", Duration::from_millis(100)).unwrap();
        assert!(!res.success());
        assert_eq!(ch.running(), 1);

        let started = Instant::now();
        let res = ch.execute("true", Duration::from_secs(5)).unwrap();
        assert!(res.success(), "{res:?}");
        assert!(started.elapsed() < Duration::from_millis(800));

        // The earlier failure is absorbed without touching later commands.
        thread::sleep(Duration::from_millis(1200));
        let res = ch.execute("echo done", Duration::from_secs(5)).unwrap();
        assert!(res.success());
        assert_eq!(ch.running(), 0);
    }

    #[test]
    fn poisoned_child_handle_is_still_usable() {
        let child = Arc::new(Mutex::new(Command::new("true").spawn().unwrap()));
        let held = child.clone();
        let _ = thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("holder died");
        })
        .join();
        assert!(child.is_poisoned());
        assert!(lock_or_recover(&child).wait().unwrap().success());
    }

    #[test]
    fn read_until_splits_stream_on_marker() {
        let mut ch = ProcessChannel::local();
        // The echoed command line must not itself contain the marker.
        ch.send("u=m; printf \"a 1 ${u}s\\nb 2 ${u}s\\n\"").unwrap();
        let first = ch.read_until("ms", Duration::from_secs(5)).unwrap();
        assert!(first.ends_with("a 1 ms"));
        let second = ch.read_until("ms", Duration::from_secs(5)).unwrap();
        assert_eq!(second, "\nb 2 ms");
        let rest = ch.read_until("ms", Duration::from_secs(5)).unwrap();
        assert_eq!(rest, "\n");
        assert!(matches!(
            ch.read_until("ms", Duration::from_secs(5)),
            Err(SessionError::ConnectionLost { .. })
        ));
    }

    #[test]
    fn closed_channel_rejects_send() {
        let mut ch = ProcessChannel::local();
        ch.close().unwrap();
        assert!(matches!(
            ch.send("true"),
            Err(SessionError::ConnectionLost { .. })
        ));
    }
}
