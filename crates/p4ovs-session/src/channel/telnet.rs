use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;

use super::{take_through, CommandChannel, CommandResult, Credentials};
use crate::error::{Result, SessionError};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

const LOGIN_PROMPT: &str = "login:";
const PASSWORD_PROMPT: &str = "Password:";

/// Appended to every executed command so the console reports `$?`.
const STATUS_ECHO: &str = "echo __rc=$?";

static STATUS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^__rc=(\d+)\r?$").expect("status line regex"));

/// What may precede the prompt suffix on a shell prompt line:
/// `[user@host dir]`, `user@host:dir`, a bare hostname, or nothing.
static PROMPT_HEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[[^\]]*\]|[\w.-]+@[\w.-]+(?::\S*)?|[\w.-]+)?$").expect("prompt head regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DecodeState {
    #[default]
    Data,
    Iac,
    Negotiate(u8),
    Sub,
    SubIac,
}

/// Strips telnet command sequences out of the byte stream.
///
/// Option negotiation is answered minimally: the server may echo and
/// suppress go-ahead, everything else is refused. Carriage returns and NULs
/// are dropped so callers see plain `\n`-separated text.
#[derive(Debug, Default)]
pub(crate) struct TelnetDecoder {
    state: DecodeState,
}

impl TelnetDecoder {
    pub(crate) fn feed(&mut self, input: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        for &b in input {
            self.state = match self.state {
                DecodeState::Data => match b {
                    IAC => DecodeState::Iac,
                    b'\r' | 0 => DecodeState::Data,
                    _ => {
                        data.push(b);
                        DecodeState::Data
                    }
                },
                DecodeState::Iac => match b {
                    IAC => {
                        data.push(IAC);
                        DecodeState::Data
                    }
                    WILL | WONT | DO | DONT => DecodeState::Negotiate(b),
                    SB => DecodeState::Sub,
                    _ => DecodeState::Data,
                },
                DecodeState::Negotiate(cmd) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, b]),
                        WILL if b == OPT_ECHO || b == OPT_SGA => {
                            replies.extend_from_slice(&[IAC, DO, b])
                        }
                        WILL => replies.extend_from_slice(&[IAC, DONT, b]),
                        _ => {}
                    }
                    DecodeState::Data
                }
                DecodeState::Sub => match b {
                    IAC => DecodeState::SubIac,
                    _ => DecodeState::Sub,
                },
                DecodeState::SubIac => match b {
                    SE => DecodeState::Data,
                    _ => DecodeState::Sub,
                },
            };
        }
    }
}

/// Line-oriented session over telnet, typically a VM serial console.
pub struct TelnetChannel {
    peer: String,
    stream: TcpStream,
    decoder: TelnetDecoder,
    buffer: Vec<u8>,
    prompt: String,
    prompt_seen: bool,
    last_ok: bool,
    timeout: Duration,
    closed: bool,
}

impl TelnetChannel {
    /// Connect and, when credentials are given, log in on the console.
    pub fn connect(
        host: &str,
        port: u16,
        credentials: Option<&Credentials>,
        prompt: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let peer = format!("{host}:{port}");
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| SessionError::lost(&peer, e))?
            .next()
            .ok_or_else(|| SessionError::lost(&peer, "address did not resolve"))?;
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| SessionError::lost(&peer, e))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| SessionError::lost(&peer, e))?;
        let _ = stream.set_nodelay(true);

        tracing::info!(%peer, "telnet connected");
        let mut channel = Self {
            peer,
            stream,
            decoder: TelnetDecoder::default(),
            buffer: Vec::new(),
            prompt: prompt.to_string(),
            prompt_seen: false,
            last_ok: false,
            timeout,
            closed: false,
        };
        if let Some(credentials) = credentials {
            channel.login(credentials, timeout)?;
        }
        Ok(channel)
    }

    fn login(&mut self, credentials: &Credentials, timeout: Duration) -> Result<()> {
        // Wake the console; a fresh serial line prints nothing until poked.
        self.write_line("")?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.at_prompt() {
                tracing::debug!(peer = %self.peer, "console already logged in");
                break;
            }
            if contains(&self.buffer, LOGIN_PROMPT) {
                self.buffer.clear();
                self.write_line(&credentials.username)?;
                self.wait_for(PASSWORD_PROMPT, deadline)?;
                self.buffer.clear();
                self.write_line(&credentials.password)?;
                self.wait_for_prompt(deadline)?;
                if !self.prompt_seen {
                    return Err(SessionError::Timeout(timeout));
                }
                tracing::info!(peer = %self.peer, user = %credentials.username, "logged in");
                break;
            }
            if !self.fill(deadline)? {
                return Err(SessionError::Timeout(timeout));
            }
        }
        self.buffer.clear();
        Ok(())
    }

    fn at_prompt(&self) -> bool {
        ends_at_prompt(&self.buffer, &self.prompt)
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        for &b in line.as_bytes() {
            if b == IAC {
                bytes.push(IAC);
            }
            bytes.push(b);
        }
        bytes.push(b'\n');
        self.write_raw(&bytes)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        match self.stream.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(SessionError::Timeout(self.timeout))
            }
            Err(e) => {
                self.closed = true;
                Err(SessionError::lost(&self.peer, e))
            }
        }
    }

    /// One read from the socket. Returns `false` once the deadline passes.
    fn fill(&mut self, deadline: Instant) -> Result<bool> {
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        let wait = (deadline - now).max(Duration::from_millis(1));
        self.stream
            .set_read_timeout(Some(wait))
            .map_err(|e| SessionError::lost(&self.peer, e))?;

        let mut raw = [0u8; 4096];
        match self.stream.read(&mut raw) {
            Ok(0) => {
                self.closed = true;
                Err(SessionError::lost(&self.peer, "connection closed by peer"))
            }
            Ok(n) => {
                let mut replies = Vec::new();
                self.decoder.feed(&raw[..n], &mut self.buffer, &mut replies);
                if !replies.is_empty() {
                    self.write_raw(&replies)?;
                }
                Ok(true)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(true),
            Err(e) => {
                self.closed = true;
                Err(SessionError::lost(&self.peer, e))
            }
        }
    }

    fn wait_for(&mut self, marker: &str, deadline: Instant) -> Result<()> {
        while !contains(&self.buffer, marker) {
            if !self.fill(deadline)? {
                return Err(SessionError::Timeout(self.timeout));
            }
        }
        Ok(())
    }

    fn wait_for_prompt(&mut self, deadline: Instant) -> Result<()> {
        self.prompt_seen = false;
        loop {
            if self.at_prompt() {
                self.prompt_seen = true;
                return Ok(());
            }
            if !self.fill(deadline)? {
                return Ok(());
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SessionError::lost(&self.peer, "channel closed"));
        }
        Ok(())
    }

    fn take_all(&mut self) -> String {
        String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned()
    }
}

impl CommandChannel for TelnetChannel {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.ensure_open()?;
        tracing::debug!(peer = %self.peer, %command, "telnet send");
        self.prompt_seen = false;
        self.write_line(command)
    }

    fn read_result(&mut self, timeout: Duration) -> Result<String> {
        self.ensure_open()?;
        self.wait_for_prompt(Instant::now() + timeout)?;
        if !self.prompt_seen {
            tracing::debug!(peer = %self.peer, "no prompt before timeout");
        }
        self.last_ok = self.prompt_seen;
        Ok(self.take_all())
    }

    fn read_until(&mut self, marker: &str, timeout: Duration) -> Result<String> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(head) = take_through(&mut self.buffer, marker.as_bytes()) {
                return Ok(String::from_utf8_lossy(&head).into_owned());
            }
            if !self.fill(deadline)? {
                return Ok(self.take_all());
            }
        }
    }

    fn last_command_succeeded(&self) -> bool {
        self.last_ok
    }

    /// Runs `command` followed by an echo of its exit status. Success needs
    /// both the prompt and `__rc=0`.
    fn execute(&mut self, command: &str, timeout: Duration) -> Result<CommandResult> {
        let suffix = status_suffix(command);
        let line = format!("{command}{suffix}");
        self.send(&line)?;

        let deadline = Instant::now() + timeout;
        let mut status = None;
        loop {
            if self.at_prompt() {
                status = exit_status(&self.buffer);
                if status.is_some() {
                    break;
                }
            }
            if !self.fill(deadline)? {
                break;
            }
        }
        self.prompt_seen = self.at_prompt();
        self.last_ok = self.prompt_seen && status == Some(0);
        match status {
            Some(code) if code != 0 => {
                tracing::debug!(peer = %self.peer, %command, code, "command exited non-zero")
            }
            None => tracing::debug!(peer = %self.peer, %command, "no exit status before timeout"),
            _ => {}
        }

        let raw = self.take_all();
        Ok(CommandResult::new(
            command,
            strip_status(&raw, &suffix),
            self.last_ok,
        ))
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.closed = true;
            tracing::info!(peer = %self.peer, "telnet closed");
        }
        Ok(())
    }
}

impl Drop for TelnetChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Whether the last line of `buffer` is a shell prompt ending in `prompt`.
/// Only a line after at least one newline counts, so the echoed command
/// and mid-line output such as a table header never match.
fn ends_at_prompt(buffer: &[u8], prompt: &str) -> bool {
    if prompt.is_empty() {
        return false;
    }
    let Some(nl) = buffer.iter().rposition(|&b| b == b'\n') else {
        return false;
    };
    let line = String::from_utf8_lossy(&buffer[nl + 1..]);
    line.strip_suffix(prompt)
        .is_some_and(|head| PROMPT_HEAD.is_match(head))
}

fn status_suffix(command: &str) -> String {
    let trimmed = command.trim_end();
    if trimmed.is_empty() {
        STATUS_ECHO.to_string()
    } else if trimmed.ends_with(';') || (trimmed.ends_with('&') && !trimmed.ends_with("&&")) {
        format!(" {STATUS_ECHO}")
    } else {
        format!("; {STATUS_ECHO}")
    }
}

/// Last `__rc=N` line in the buffer.
fn exit_status(buffer: &[u8]) -> Option<i32> {
    let text = String::from_utf8_lossy(buffer);
    STATUS_LINE
        .captures_iter(&text)
        .last()
        .and_then(|caps| caps[1].parse().ok())
}

/// Drop the status echo from the echoed command line and the status line
/// from the output.
fn strip_status(raw: &str, suffix: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, line) in raw.split_inclusive('\n').enumerate() {
        let body = line.trim_end_matches(['\r', '\n']);
        if i == 0 {
            if let Some(head) = body.strip_suffix(suffix) {
                out.push_str(head);
                out.push_str(&line[body.len()..]);
                continue;
            }
        }
        if STATUS_LINE.is_match(body) {
            continue;
        }
        out.push_str(line);
    }
    out
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w == needle.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};

    fn read_line_bytes(reader: &mut impl BufRead) -> Vec<u8> {
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).unwrap();
        line
    }
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn decoder_strips_negotiation_and_answers() {
        let mut dec = TelnetDecoder::default();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        dec.feed(
            &[IAC, WILL, OPT_ECHO, b'h', b'i', b'\r', b'\n', IAC, DO, 24],
            &mut data,
            &mut replies,
        );
        assert_eq!(data, b"hi\n");
        assert_eq!(replies, [IAC, DO, OPT_ECHO, IAC, WONT, 24]);
    }

    #[test]
    fn decoder_handles_sequences_split_across_reads() {
        let mut dec = TelnetDecoder::default();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        dec.feed(&[b'a', IAC], &mut data, &mut replies);
        dec.feed(&[IAC, b'b', IAC, SB, 24, 1], &mut data, &mut replies);
        dec.feed(&[IAC, SE, b'c'], &mut data, &mut replies);
        assert_eq!(data, [b'a', IAC, b'b', b'c']);
        assert!(replies.is_empty());
    }

    #[test]
    fn decoder_refuses_unknown_will() {
        let mut dec = TelnetDecoder::default();
        let mut data = Vec::new();
        let mut replies = Vec::new();
        dec.feed(&[IAC, WILL, 31, IAC, WONT, 1], &mut data, &mut replies);
        assert!(data.is_empty());
        assert_eq!(replies, [IAC, DONT, 31]);
    }

    /// Minimal console: login, then echo each command followed by canned
    /// output and a prompt.
    fn fake_console(listener: TcpListener) {
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);

        read_line_bytes(&mut reader);
        writer.write_all(&[IAC, WILL, OPT_ECHO]).unwrap();
        writer.write_all(b"\r\nvm login: ").unwrap();
        // The negotiation reply arrives ahead of the username.
        assert!(read_line_bytes(&mut reader).ends_with(b"root\n"));
        writer.write_all(b"Password: ").unwrap();
        assert_eq!(read_line_bytes(&mut reader), b"secret\n");
        writer.write_all(b"\r\nroot@vm:~# ").unwrap();

        loop {
            let line = read_line_bytes(&mut reader);
            if line.is_empty() {
                break;
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            let line = line.trim_end();
            writer.write_all(format!("{line}\r\n").as_bytes()).unwrap();
            let (cmd, report) = match line.strip_suffix("; echo __rc=$?") {
                Some(cmd) => (cmd, true),
                None => (line, false),
            };
            let code = match cmd {
                "netperf -V" => {
                    writer.write_all(b"Netperf version 2.7.0\r\n").unwrap();
                    0
                }
                "netperf -H 10.0.0.2 -t UDP_STREAM" => {
                    // The header's last column ends in "# " and arrives
                    // well before the results.
                    writer
                        .write_all(
                            b"Socket  Message  Elapsed      Messages\r\n\
                              Size    Size     Time         Okay Errors   Throughput\r\n\
                              bytes   bytes    secs            #      # ",
                        )
                        .unwrap();
                    writer.flush().unwrap();
                    thread::sleep(Duration::from_millis(300));
                    writer
                        .write_all(
                            b"  10^6bits/sec\r\n\r\n\
                              212992   65507   10.00      18960      0     99.27\r\n",
                        )
                        .unwrap();
                    0
                }
                "ip addr add 1.1.1.1/24 dev ens3" => {
                    writer.write_all(b"RTNETLINK answers: File exists\r\n").unwrap();
                    2
                }
                // never prints a prompt
                "hang" => continue,
                _ => 0,
            };
            if report {
                writer.write_all(format!("__rc={code}\r\n").as_bytes()).unwrap();
            }
            writer.write_all(b"root@vm:~# ").unwrap();
        }
    }

    fn connect_console() -> (TelnetChannel, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || fake_console(listener));

        let creds = Credentials::new("root", "secret");
        let ch = TelnetChannel::connect(
            "127.0.0.1",
            port,
            Some(&creds),
            "# ",
            Duration::from_secs(5),
        )
        .unwrap();
        (ch, server)
    }

    #[test]
    fn login_and_execute_against_fake_console() {
        let (mut ch, server) = connect_console();

        let res = ch.execute("netperf -V", Duration::from_secs(5)).unwrap();
        assert!(res.success());
        assert_eq!(res.output(), "netperf -V\nNetperf version 2.7.0\nroot@vm:~# ");

        let res = ch.execute("hang", Duration::from_millis(200)).unwrap();
        assert!(!res.success());
        assert_eq!(res.output(), "hang\n");

        ch.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn nonzero_exit_status_fails_despite_prompt() {
        let (mut ch, server) = connect_console();

        let res = ch
            .execute("ip addr add 1.1.1.1/24 dev ens3", Duration::from_secs(5))
            .unwrap();
        assert!(!res.success());
        assert!(!ch.last_command_succeeded());
        assert_eq!(
            res.output(),
            "ip addr add 1.1.1.1/24 dev ens3\nRTNETLINK answers: File exists\nroot@vm:~# "
        );

        let res = ch.execute("ip link set ens3 up", Duration::from_secs(5)).unwrap();
        assert!(res.success());
        assert_eq!(res.body(), "root@vm:~# ");

        ch.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn table_header_ending_in_hash_is_not_a_prompt() {
        let (mut ch, server) = connect_console();

        let res = ch
            .execute("netperf -H 10.0.0.2 -t UDP_STREAM", Duration::from_secs(5))
            .unwrap();
        assert!(res.success());
        assert!(res.body().contains("99.27"), "{:?}", res.output());
        assert!(res.output().ends_with("root@vm:~# "));

        ch.send("netperf -H 10.0.0.2 -t UDP_STREAM").unwrap();
        let out = ch.read_result(Duration::from_secs(5)).unwrap();
        assert!(ch.last_command_succeeded());
        assert!(out.contains("99.27"), "{out:?}");

        ch.close().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn prompt_must_start_its_own_line() {
        assert!(ends_at_prompt(b"\nroot@vm:~# ", "# "));
        assert!(ends_at_prompt(b"out\n[root@vm ~]# ", "# "));
        assert!(ends_at_prompt(b"out\nlocalhost# ", "# "));
        assert!(ends_at_prompt(b"\n# ", "# "));
        assert!(!ends_at_prompt(b"root@vm:~# ", "# "));
        assert!(!ends_at_prompt(b"\nbytes   bytes    secs            #      # ", "# "));
        assert!(!ends_at_prompt(b"\nroot@vm:~# ls", "# "));
        assert!(!ends_at_prompt(b"\nroot@vm:~# ", ""));
    }

    #[test]
    fn status_echo_follows_command_shape() {
        assert_eq!(status_suffix("ip a"), "; echo __rc=$?");
        assert_eq!(status_suffix("netserver &"), " echo __rc=$?");
        assert_eq!(status_suffix("true && false"), "; echo __rc=$?");
        assert_eq!(status_suffix("cd /tmp;"), " echo __rc=$?");
        assert_eq!(exit_status(b"x; echo __rc=$?\nout\n__rc=0\n__rc=127\n# "), Some(127));
        assert_eq!(exit_status(b"x; echo __rc=$?\n# "), None);
    }

    #[test]
    fn peer_disconnect_is_connection_lost() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        let mut ch =
            TelnetChannel::connect("127.0.0.1", port, None, "# ", Duration::from_secs(5)).unwrap();
        server.join().unwrap();
        let err = ch.read_until("ms", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, SessionError::ConnectionLost { .. }));
        assert!(ch.send("true").is_err());
    }
}
