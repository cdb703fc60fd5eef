//! Helper process lifecycle: spawn once, reuse, destroy on failure.
//!
//! A [`HelperRegistry`] keeps at most one live helper per [`HelperKey`]. Handles are
//! shared, and every write-then-read pair runs under the helper's own lock so two
//! authentication attempts never consume each other's replies.
use std::collections::HashMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::mem;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info};
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;

use crate::cache::ConnectionId;
use crate::codec::MAX_LINE_LEN;
use crate::{AuthError, ConfigError, Mechanism};

/// A helper program and its arguments
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct HelperCommand {
    program: String,
    args: Vec<String>,
}

impl HelperCommand {
    pub fn new<P, I, S>(program: P, args: I) -> HelperCommand
    where
        P: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        HelperCommand {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line into program and arguments.
    ///
    /// Words are separated by whitespace. Single quotes group literally, double quotes
    /// group with backslash escapes, and a backslash outside quotes escapes the next
    /// character.
    pub fn parse(line: &str) -> Result<HelperCommand, ConfigError> {
        let invalid = || ConfigError::Command(line.to_owned());

        let mut words = Vec::new();
        let mut word = String::new();
        let mut in_word = false;
        let mut quote: Option<char> = None;
        let mut chars = line.chars();

        while let Some(c) = chars.next() {
            match (quote, c) {
                (Some('\''), '\'') => quote = None,
                (Some('\''), c) => word.push(c),
                (_, '\\') => {
                    word.push(chars.next().ok_or_else(invalid)?);
                    in_word = true;
                }
                (Some(q), c) if c == q => quote = None,
                (Some(_), c) => word.push(c),
                (None, '"') | (None, '\'') => {
                    quote = Some(c);
                    in_word = true;
                }
                (None, c) if c.is_whitespace() => {
                    if in_word {
                        words.push(mem::take(&mut word));
                        in_word = false;
                    }
                }
                (None, c) => {
                    word.push(c);
                    in_word = true;
                }
            }
        }
        if quote.is_some() {
            return Err(invalid());
        }
        if in_word {
            words.push(word);
        }

        let mut words = words.into_iter();
        let program = words.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
        Ok(HelperCommand { program, args: words.collect() })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl TryFrom<String> for HelperCommand {
    type Error = ConfigError;

    fn try_from(line: String) -> Result<HelperCommand, ConfigError> {
        HelperCommand::parse(&line)
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The duplex byte stream to one running helper
pub trait HelperConnection: Send {
    fn pid(&self) -> Option<u32>;

    /// Write `line`, returning how many bytes made it to the helper
    fn write_line(&mut self, line: &[u8]) -> io::Result<usize>;

    /// Read up to `max_len` bytes, stopping after a newline. `None` means EOF.
    fn read_line(&mut self, max_len: usize) -> io::Result<Option<String>>;

    /// Close both directions and reap the process
    fn terminate(&mut self);
}

/// Starts helper programs
pub trait HelperLauncher: Send + Sync {
    fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperConnection>, AuthError>;
}

/// Launches helpers as child processes with piped stdin/stdout.
/// stderr is inherited, so helper diagnostics end up in the host's log.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessLauncher;

impl HelperLauncher for ProcessLauncher {
    fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperConnection>, AuthError> {
        let spawn_error = |source| AuthError::Spawn { program: command.program().to_owned(), source };

        let mut child = Command::new(command.program())
            .args(command.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => Ok(Box::new(ChildConnection {
                child,
                stdin: Some(stdin),
                stdout: BufReader::new(stdout),
                reaped: false,
            })),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                Err(spawn_error(io::Error::new(io::ErrorKind::BrokenPipe, "helper pipes unavailable")))
            }
        }
    }
}

struct ChildConnection {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    reaped: bool,
}

fn unsolicited_output() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "helper sent more than one line")
}

impl HelperConnection for ChildConnection {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<usize> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "helper stdin closed"))?;
        // output nobody asked for would be taken as the reply to this line
        if !self.stdout.buffer().is_empty() {
            return Err(unsolicited_output());
        }

        let mut written = 0;
        while written < line.len() {
            match stdin.write(&line[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        stdin.flush()?;
        Ok(written)
    }

    fn read_line(&mut self, max_len: usize) -> io::Result<Option<String>> {
        let mut buf = Vec::with_capacity(128);
        let read = self.stdout.by_ref().take(max_len as u64).read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        // exactly one line per request
        if buf.last() == Some(&b'\n') && !self.stdout.buffer().is_empty() {
            return Err(unsolicited_output());
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        // closing stdin is enough for ntlm_auth to exit, kill covers the rest
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildConnection {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Which helper slot a handle occupies.
/// `connection` is set when helpers are scoped to a single client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HelperKey {
    pub mechanism: Mechanism,
    pub connection: Option<ConnectionId>,
}

impl HelperKey {
    pub fn per_connection(mechanism: Mechanism, connection: ConnectionId) -> HelperKey {
        HelperKey { mechanism, connection: Some(connection) }
    }
}

impl From<Mechanism> for HelperKey {
    fn from(mechanism: Mechanism) -> HelperKey {
        HelperKey { mechanism, connection: None }
    }
}

/// One running helper
pub struct HelperProcess {
    id: u64,
    key: HelperKey,
    pid: Option<u32>,
    alive: AtomicBool,
    connection: Mutex<Option<Box<dyn HelperConnection>>>,
}

pub type HelperHandle = Arc<HelperProcess>;

impl HelperProcess {
    /// Registry-unique id; a respawned helper never reuses the id of its predecessor
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> HelperKey {
        self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Take exclusive use of the pipe. Blocks while another exchange is in flight.
    pub fn lock(&self) -> Result<HelperSession<'_>, AuthError> {
        let guard = self.connection.lock();
        if guard.is_none() {
            return Err(AuthError::HelperGone);
        }
        Ok(HelperSession { guard })
    }

    fn close(&self) {
        self.alive.store(false, Ordering::Release);
        let connection = self.connection.lock().take();
        if let Some(mut connection) = connection {
            debug!("freeing {} helper {:?}", self.key.mechanism, self.pid);
            connection.terminate();
        }
    }
}

impl fmt::Debug for HelperProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperProcess")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a helper's pipe
pub struct HelperSession<'a> {
    guard: MutexGuard<'a, Option<Box<dyn HelperConnection>>>,
}

impl HelperSession<'_> {
    fn connection(&mut self) -> Result<&mut Box<dyn HelperConnection>, AuthError> {
        self.guard.as_mut().ok_or(AuthError::HelperGone)
    }

    /// Write a whole line; a short write counts as a dead helper
    pub fn write_line(&mut self, line: &[u8]) -> Result<usize, AuthError> {
        let written = self.connection()?.write_line(line)?;
        if written < line.len() {
            return Err(AuthError::ShortWrite { written, expected: line.len() });
        }
        Ok(written)
    }

    /// Read one line, newline included
    pub fn read_line(&mut self, max_len: usize) -> Result<String, AuthError> {
        match self.connection()?.read_line(max_len)? {
            None => Err(AuthError::Eof),
            Some(line) if line.len() >= max_len && !line.ends_with('\n') => Err(AuthError::LineTooLong(max_len)),
            Some(line) => Ok(line),
        }
    }
}

/// Live helpers, at most one per key
pub struct HelperRegistry {
    launcher: Box<dyn HelperLauncher>,
    slots: Mutex<HashMap<HelperKey, HelperHandle>>,
    /// Serializes spawning per key
    launching: Mutex<HashMap<HelperKey, Arc<Mutex<()>>>>,
    next_id: AtomicU64,
    max_line_len: usize,
}

impl HelperRegistry {
    pub fn new<L: HelperLauncher + 'static>(launcher: L) -> HelperRegistry {
        HelperRegistry {
            launcher: Box::new(launcher),
            slots: Mutex::new(HashMap::new()),
            launching: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_line_len: MAX_LINE_LEN,
        }
    }

    pub fn with_max_line_len(mut self, max_line_len: usize) -> HelperRegistry {
        self.max_line_len = max_line_len;
        self
    }

    fn live(&self, key: &HelperKey) -> Option<HelperHandle> {
        self.slots.lock().get(key).filter(|handle| handle.is_alive()).cloned()
    }

    /// Return the live helper for `key`, spawning `command` if there is none.
    ///
    /// A failed spawn leaves the slot empty, so the next call simply tries again.
    /// Spawning only holds up other callers of the same key.
    pub fn acquire<K: Into<HelperKey>>(&self, key: K, command: &HelperCommand) -> Result<HelperHandle, AuthError> {
        let key = key.into();
        if let Some(handle) = self.live(&key) {
            debug!("using existing {} helper {:?}", key.mechanism, handle.pid);
            return Ok(handle);
        }

        let gate = Arc::clone(self.launching.lock().entry(key).or_default());
        let _launching = gate.lock();
        // someone else may have launched it while we waited
        if let Some(handle) = self.live(&key) {
            return Ok(handle);
        }

        let connection = self.launcher.launch(command).map_err(|err| {
            error!("couldn't spawn {} helper '{}': {}", key.mechanism, command, err);
            err
        })?;
        let handle = Arc::new(HelperProcess {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            pid: connection.pid(),
            alive: AtomicBool::new(true),
            connection: Mutex::new(Some(connection)),
        });
        info!("launched {} helper '{}', pid {:?}", key.mechanism, command, handle.pid);
        self.slots.lock().insert(key, Arc::clone(&handle));
        Ok(handle)
    }

    /// Close the helper and free its slot. The handle stays unusable afterwards.
    pub fn destroy(&self, handle: &HelperHandle) {
        {
            let mut slots = self.slots.lock();
            if slots.get(&handle.key).map_or(false, |current| Arc::ptr_eq(current, handle)) {
                slots.remove(&handle.key);
            }
        }
        handle.close();
    }

    /// Send one line and read one reply while holding the helper's lock.
    /// A helper that fails mid-exchange is destroyed before returning.
    pub fn transact(&self, handle: &HelperHandle, line: &str) -> Result<String, AuthError> {
        let result = handle.lock().and_then(|mut session| {
            session.write_line(line.as_bytes())?;
            session.read_line(self.max_line_len)
        });
        if let Err(ref err) = result {
            if err.is_helper_fault() {
                error!("{} helper {:?} failed: {}", handle.key.mechanism, handle.pid, err);
                self.destroy(handle);
            }
        }
        result
    }

    /// Destroy every helper scoped to `connection`
    pub fn release_connection(&self, connection: ConnectionId) {
        let released = {
            let mut slots = self.slots.lock();
            let keys = slots
                .keys()
                .filter(|key| key.connection == Some(connection))
                .copied()
                .collect::<Vec<_>>();
            keys.into_iter().filter_map(|key| slots.remove(&key)).collect::<Vec<_>>()
        };
        self.launching.lock().retain(|key, _| key.connection != Some(connection));
        for handle in released {
            handle.close();
        }
    }

    /// Destroy all helpers
    pub fn shutdown(&self) {
        let handles = self.slots.lock().drain().map(|(_, handle)| handle).collect::<Vec<_>>();
        for handle in handles {
            handle.close();
        }
    }

    /// Number of live helper slots
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HelperRegistry")
            .field("helpers", &self.len())
            .field("max_line_len", &self.max_line_len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedLauncher, Step};
    use std::sync::mpsc;
    use std::thread;

    fn ntlm_command() -> HelperCommand {
        HelperCommand::new("ntlm_auth", ["--helper-protocol=squid-2.5-ntlmssp"])
    }

    /// Holds launches of the `slow` program until released
    struct GatedLauncher {
        inner: ScriptedLauncher,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl HelperLauncher for GatedLauncher {
        fn launch(&self, command: &HelperCommand) -> Result<Box<dyn HelperConnection>, AuthError> {
            if command.program() == "slow" {
                let _ = self.entered.lock().send(());
                let _ = self.release.lock().recv();
            }
            self.inner.launch(command)
        }
    }

    #[test]
    fn parses_command_lines() {
        let cmd = HelperCommand::parse("ntlm_auth --helper-protocol=squid-2.5-ntlmssp").unwrap();
        assert_eq!(cmd.program(), "ntlm_auth");
        assert_eq!(cmd.args(), ["--helper-protocol=squid-2.5-ntlmssp"]);

        let cmd = HelperCommand::parse("  /usr/bin/ntlm_auth   --require-membership-of='DOM\\Web Users' \"a b\"  ").unwrap();
        assert_eq!(cmd.program(), "/usr/bin/ntlm_auth");
        assert_eq!(cmd.args(), ["--require-membership-of=DOM\\Web Users", "a b"]);

        let cmd = HelperCommand::parse("helper a\\ b \"x\\\"y\" ''").unwrap();
        assert_eq!(cmd.args(), ["a b", "x\"y", ""]);
        assert_eq!(cmd.to_string(), "helper a b x\"y ");
    }

    #[test]
    fn rejects_bad_command_lines() {
        for line in ["", "   ", "'unterminated", "trailing\\", "'' arg"] {
            assert!(HelperCommand::parse(line).is_err(), "{:?}", line);
        }
    }

    #[test]
    fn acquire_reuses_the_live_helper() {
        let launcher = ScriptedLauncher::new();
        let registry = HelperRegistry::new(launcher.clone());

        let first = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        let second = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(launcher.spawned(), 1);

        // other mechanisms get their own helper
        let negotiate = registry.acquire(Mechanism::Negotiate, &ntlm_command()).unwrap();
        assert_ne!(negotiate.id(), first.id());
        assert_eq!(launcher.spawned(), 2);
    }

    #[test]
    fn destroyed_helper_is_never_reused() {
        let launcher = ScriptedLauncher::new();
        let registry = HelperRegistry::new(launcher.clone());

        let first = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        registry.destroy(&first);
        assert!(!first.is_alive());
        assert!(matches!(first.lock(), Err(AuthError::HelperGone)));
        assert!(matches!(registry.transact(&first, "YR abc\n"), Err(AuthError::HelperGone)));
        assert_eq!(launcher.terminated(), 1);

        let second = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(launcher.spawned(), 2);
    }

    #[test]
    fn failed_spawn_is_retried_on_next_acquire() {
        let launcher = ScriptedLauncher::new();
        launcher.fail_next_spawn();
        let registry = HelperRegistry::new(launcher.clone());

        assert!(matches!(registry.acquire(Mechanism::Ntlm, &ntlm_command()), Err(AuthError::Spawn { .. })));
        assert!(registry.is_empty());
        assert!(registry.acquire(Mechanism::Ntlm, &ntlm_command()).is_ok());
        assert_eq!(launcher.spawned(), 1);
    }

    #[test]
    fn transact_writes_one_line_and_reads_one_reply() {
        let launcher = ScriptedLauncher::new();
        launcher.push(Step::reply("TT Y2hhbGxlbmdl\n"));
        launcher.push(Step::reply("AF alice\n"));
        let registry = HelperRegistry::new(launcher.clone());

        let helper = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        assert_eq!(registry.transact(&helper, "YR bmVnb3RpYXRl\n").unwrap(), "TT Y2hhbGxlbmdl\n");
        assert_eq!(launcher.written(), vec!["YR bmVnb3RpYXRl\n"]);
        assert!(helper.is_alive());
    }

    #[test]
    fn eof_destroys_the_helper() {
        let launcher = ScriptedLauncher::new();
        launcher.push(Step::Eof);
        let registry = HelperRegistry::new(launcher.clone());

        let helper = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        assert!(matches!(registry.transact(&helper, "YR abc\n"), Err(AuthError::Eof)));
        assert!(!helper.is_alive());
        assert!(registry.is_empty());

        let respawned = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        assert_ne!(respawned.id(), helper.id());
    }

    #[test]
    fn short_write_destroys_the_helper() {
        let launcher = ScriptedLauncher::new();
        launcher.push(Step::ShortWrite);
        let registry = HelperRegistry::new(launcher.clone());

        let helper = registry.acquire(Mechanism::Basic, &ntlm_command()).unwrap();
        assert!(matches!(
            registry.transact(&helper, "bob secret\n"),
            Err(AuthError::ShortWrite { written: 5, expected: 11 })
        ));
        assert!(!helper.is_alive());
    }

    #[test]
    fn overlong_line_destroys_the_helper() {
        let launcher = ScriptedLauncher::new();
        launcher.push(Step::reply(&format!("TT {}\n", "A".repeat(64))));
        let registry = HelperRegistry::new(launcher.clone()).with_max_line_len(16);

        let helper = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        assert!(matches!(registry.transact(&helper, "YR abc\n"), Err(AuthError::LineTooLong(16))));
        assert!(!helper.is_alive());
    }

    #[test]
    fn concurrent_acquire_spawns_once() {
        let launcher = ScriptedLauncher::new();
        let registry = HelperRegistry::new(launcher.clone());

        let ids = thread::scope(|s| {
            let workers = (0..8)
                .map(|_| s.spawn(|| registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap().id()))
                .collect::<Vec<_>>();
            workers.into_iter().map(|w| w.join().unwrap()).collect::<Vec<_>>()
        });
        assert!(ids.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(launcher.spawned(), 1);
    }

    #[test]
    fn slow_spawn_only_holds_up_its_own_key() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let launcher = ScriptedLauncher::new();
        let registry = HelperRegistry::new(GatedLauncher {
            inner: launcher.clone(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let slow = HelperCommand::new("slow", Vec::<String>::new());

        thread::scope(|s| {
            let pending = s.spawn(|| registry.acquire(Mechanism::Negotiate, &slow));
            entered_rx.recv().unwrap();

            // Negotiate is still launching
            let ntlm = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
            registry.destroy(&ntlm);
            registry.release_connection(ConnectionId::from(1));

            release_tx.send(()).unwrap();
            assert!(pending.join().unwrap().is_ok());
        });
        assert_eq!(launcher.spawned(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn per_connection_helpers_are_released_with_their_connection() {
        let launcher = ScriptedLauncher::new();
        let registry = HelperRegistry::new(launcher.clone());
        let (a, b) = (ConnectionId::from(1), ConnectionId::from(2));

        let shared = registry.acquire(Mechanism::Ntlm, &ntlm_command()).unwrap();
        let for_a = registry.acquire(HelperKey::per_connection(Mechanism::Ntlm, a), &ntlm_command()).unwrap();
        let for_b = registry.acquire(HelperKey::per_connection(Mechanism::Ntlm, b), &ntlm_command()).unwrap();
        assert_eq!(launcher.spawned(), 3);

        registry.release_connection(a);
        assert!(!for_a.is_alive());
        assert!(for_b.is_alive());
        assert!(shared.is_alive());
        assert_eq!(registry.len(), 2);

        registry.shutdown();
        assert!(!for_b.is_alive());
        assert!(!shared.is_alive());
        assert!(registry.is_empty());
    }
}
