use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::errors::{AdvisorError, Result};

const QUIT_GRACE: Duration = Duration::from_millis(300);
const QUIT_POLL: Duration = Duration::from_millis(10);

/// Shared handle on a helper's stdin. The pool coordinator keeps a clone so
/// it can issue `stop` to an in-flight helper from outside the owning
/// worker thread.
#[derive(Clone, Debug)]
pub struct CommandPipe {
    stdin: Arc<Mutex<ChildStdin>>,
}

impl CommandPipe {
    /// Write one protocol line and flush it.
    pub fn send_line(&self, line: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().unwrap();
        writeln!(stdin, "{}", line)
            .map_err(|e| AdvisorError::CommunicationError(format!("send failed: {}", e)))?;
        stdin
            .flush()
            .map_err(|e| AdvisorError::CommunicationError(format!("flush failed: {}", e)))
    }
}

/// One spawned helper process with its two byte streams. Requests borrow
/// the session but never close or replace its streams; the session lives
/// until the pool itself is dropped.
#[derive(Debug)]
pub struct HelperSession {
    child: Arc<Mutex<Child>>,
    commands: CommandPipe,
    reader: BufReader<ChildStdout>,
    index: usize,
}

impl HelperSession {
    /// Spawn the helper executable with connected pipes. The handshake is a
    /// separate step so the caller can hold its coordination lock across
    /// both.
    pub fn spawn(path: &str, index: usize) -> Result<Self> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                AdvisorError::LaunchError(format!("failed to start helper '{}': {}", path, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdvisorError::LaunchError("failed to get helper stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AdvisorError::LaunchError("failed to get helper stdout".to_string()))?;

        debug!(index, path, "helper process started");

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            commands: CommandPipe {
                stdin: Arc::new(Mutex::new(stdin)),
            },
            reader: BufReader::new(stdout),
            index,
        })
    }

    /// Configure the helper and complete the protocol handshake: one
    /// `setoption` per `key=value` pair in `options` (pairs delimited by
    /// `=` and `;`), then `uci`, then read until `uciok`. A helper that
    /// advertises a SyzygyPath option while we scan is pointed at the
    /// tablebase directory immediately, when one is configured.
    pub fn handshake(&mut self, options: &str, tablebase_path: Option<&str>) -> Result<()> {
        for (key, value) in parse_option_pairs(options) {
            self.send_line(&format!("setoption name {} value {}", key, value))?;
        }
        self.send_line("uci")?;

        loop {
            let line = self.read_line()?.ok_or_else(|| {
                AdvisorError::HandshakeError(format!(
                    "helper {} closed its pipe before uciok",
                    self.index
                ))
            })?;
            trace!(index = self.index, line = %line, "handshake");

            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("uciok") => break,
                Some("option") => {
                    if tokens.next() == Some("name") && tokens.next() == Some("SyzygyPath") {
                        if let Some(path) = tablebase_path {
                            self.send_line(&format!("setoption name SyzygyPath value {}", path))?;
                        }
                    }
                }
                _ => {}
            }
        }
        debug!(index = self.index, "helper ready");
        Ok(())
    }

    pub fn send_line(&self, line: &str) -> Result<()> {
        self.commands.send_line(line)
    }

    /// Blocking read of one line. `Ok(None)` means the helper closed its
    /// output stream.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| AdvisorError::CommunicationError(format!("read failed: {}", e)))?;
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(line.trim_end().to_string()))
        }
    }

    /// Non-blocking liveness poll.
    pub fn is_running(&self) -> bool {
        matches!(self.child.lock().unwrap().try_wait(), Ok(None))
    }

    /// Clone the shared stdin handle.
    pub fn commands(&self) -> CommandPipe {
        self.commands.clone()
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for HelperSession {
    fn drop(&mut self) {
        // Ask politely, then wait a moment, then kill. The session is the
        // sole owner of the process; every exit path ends here.
        let _ = self.send_line("quit");
        if let Ok(mut child) = self.child.lock() {
            let deadline = Instant::now() + QUIT_GRACE;
            while Instant::now() < deadline {
                if let Ok(Some(_)) = child.try_wait() {
                    return;
                }
                std::thread::sleep(QUIT_POLL);
            }
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Split `"Threads=1;Hash=64"` into its key/value pairs. Fragments without
/// an `=` are dropped.
fn parse_option_pairs(options: &str) -> Vec<(String, String)> {
    options
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_option_pairs() {
        let pairs = parse_option_pairs("Threads=1;Hash=64");
        assert_eq!(
            pairs,
            vec![
                ("Threads".to_string(), "1".to_string()),
                ("Hash".to_string(), "64".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_option_pairs_tolerates_junk() {
        assert!(parse_option_pairs("").is_empty());
        assert!(parse_option_pairs(";;").is_empty());
        let pairs = parse_option_pairs("MultiPV=2;garbage;=5");
        assert_eq!(pairs, vec![("MultiPV".to_string(), "2".to_string())]);
    }

    #[test]
    fn test_spawn_failure_is_launch_error() {
        let err = HelperSession::spawn("/nonexistent/helper-binary", 0).unwrap_err();
        assert!(matches!(err, AdvisorError::LaunchError(_)));
    }
}
