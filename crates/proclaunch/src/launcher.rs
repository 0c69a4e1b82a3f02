//! Launcher - owns the launcher thread and hands out owner handles.
//!
//! Flow:
//! 1. Build a current-thread runtime and move it onto a dedicated OS thread
//! 2. Run the dispatcher there; it connects to the helper in the background
//! 3. `register` creates an owner handle and its worker-side counterpart
//! 4. `shutdown` (or drop) stops the helper and joins the thread

use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::bridge::protocol::{ProcessMode, Token};
use crate::cell::TokenCell;
use crate::channel::{Channel, ConnectionState};
use crate::dispatcher::{Command, Dispatcher};
use crate::error::{LaunchError, UsageError};
use crate::owner::OwnerHandle;
use crate::spawner::{HelperSpawner, ProcessSpawner};

pub struct LauncherConfig {
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub thread_name: String,
    pub spawner: Arc<dyn HelperSpawner>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl LauncherConfig {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            thread_name: "proclaunch".to_string(),
            spawner: Arc::new(ProcessSpawner::sibling()),
        }
    }

    /// Defaults overridden by `PROCLAUNCH_HELPER`,
    /// `PROCLAUNCH_CONNECT_TIMEOUT_MS` and `PROCLAUNCH_SHUTDOWN_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::new();
        if let Some(helper) = lookup("PROCLAUNCH_HELPER") {
            config.spawner = Arc::new(ProcessSpawner::new(helper));
        }
        if let Some(timeout) = millis(&lookup, "PROCLAUNCH_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = timeout;
        }
        if let Some(timeout) = millis(&lookup, "PROCLAUNCH_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown_timeout = timeout;
        }
        config
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn HelperSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid timeout");
            None
        }
    }
}

pub struct Launcher {
    commands: mpsc::UnboundedSender<Command>,
    connection: Arc<AtomicU8>,
    worker: Option<JoinHandle<()>>,
    worker_thread: ThreadId,
}

impl Launcher {
    pub fn start(config: LauncherConfig) -> Result<Self, LaunchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(LaunchError::Runtime)?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(AtomicU8::new(ConnectionState::NotConnected as u8));
        let dispatcher = Dispatcher::new(
            Channel::new(Arc::clone(&connection)),
            command_rx,
            config.spawner,
            config.connect_timeout,
            config.shutdown_timeout,
        );

        let worker = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || runtime.block_on(dispatcher.run()))
            .map_err(LaunchError::Thread)?;
        let worker_thread = worker.thread().id();

        tracing::info!(thread = %config.thread_name, "Launcher started");
        Ok(Self {
            commands,
            connection,
            worker: Some(worker),
            worker_thread,
        })
    }

    /// Create a handle for a new process instance with a fresh token.
    pub fn register(&self, mode: ProcessMode) -> OwnerHandle {
        let token = Token::next();
        let cell = TokenCell::new(token);
        if self
            .commands
            .send(Command::Register {
                token,
                mode,
                cell: Arc::clone(&cell),
            })
            .is_err()
        {
            tracing::warn!(%token, "Launcher is shut down, handle will fail on start");
        }
        OwnerHandle::new(token, mode, cell, self.commands.clone(), self.worker_thread)
    }

    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::load(&self.connection)
    }

    pub fn worker_thread_id(&self) -> ThreadId {
        self.worker_thread
    }

    /// Stop the helper and join the launcher thread. Every process still
    /// running gets a terminal failure. Idempotent.
    ///
    /// Fails with [`UsageError::WorkerThread`] on the launcher thread itself,
    /// which cannot join itself; nothing is stopped in that case.
    pub fn shutdown(&mut self) -> Result<(), UsageError> {
        if std::thread::current().id() == self.worker_thread {
            return Err(UsageError::WorkerThread);
        }
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Shutdown);
        if worker.join().is_err() {
            tracing::error!("Launcher thread panicked");
        }
        tracing::info!("Launcher stopped");
        Ok(())
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            // The event loop still exits; the thread is detached instead of joined.
            tracing::error!(error = %e, "Launcher dropped on its own thread");
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use async_trait::async_trait;
    use futures::future::BoxFuture;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::bridge::codec::JsonCodec;
    use crate::bridge::protocol::{HelperRequest, HelperResponse};
    use crate::cell::{FailureKind, ProcessState, SignalKind, SignalRecord};
    use crate::dispatcher::{INVALID_PACKET, LAUNCHER_SHUT_DOWN, OVERSIZED_PACKET, SOCKET_CLOSED};
    use crate::error::{SpawnError, UsageError};
    use crate::spawner::{HelperConnection, InProcessSpawner};
    use crate::worker_handle::CANCELED_BEFORE_START;

    const LONG: Duration = Duration::from_secs(30);

    type Script = Box<dyn Fn(UnixStream) -> BoxFuture<'static, ()> + Send + Sync>;

    /// Helper stand-in that runs a test script against the launcher's socket.
    struct ScriptedSpawner(Script);

    #[async_trait]
    impl HelperSpawner for ScriptedSpawner {
        async fn connect(&self) -> Result<HelperConnection, SpawnError> {
            let (ours, theirs) = UnixStream::pair()?;
            tokio::spawn((self.0)(theirs));
            Ok(HelperConnection {
                stream: ours,
                child: None,
            })
        }
    }

    /// Takes a while to connect, then behaves like the wrapped spawner.
    struct SlowSpawner(Duration, ScriptedSpawner);

    #[async_trait]
    impl HelperSpawner for SlowSpawner {
        async fn connect(&self) -> Result<HelperConnection, SpawnError> {
            tokio::time::sleep(self.0).await;
            self.1.connect().await
        }
    }

    struct FailingSpawner;

    #[async_trait]
    impl HelperSpawner for FailingSpawner {
        async fn connect(&self) -> Result<HelperConnection, SpawnError> {
            Err(SpawnError::Other("no helper here".to_string()))
        }
    }

    fn in_process() -> Launcher {
        Launcher::start(LauncherConfig::new().with_spawner(Arc::new(InProcessSpawner))).unwrap()
    }

    fn scripted(script: Script) -> Launcher {
        Launcher::start(LauncherConfig::new().with_spawner(Arc::new(ScriptedSpawner(script))))
            .unwrap()
    }

    /// Records every request and never answers; closes on Shutdown.
    fn recording(seen: Arc<Mutex<Vec<HelperRequest>>>) -> Script {
        Box::new(move |stream: UnixStream| -> BoxFuture<'static, ()> {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                let mut reader = FramedRead::new(stream, JsonCodec::<HelperRequest>::new());
                while let Some(Ok(request)) = reader.next().await {
                    let shutdown = request == HelperRequest::Shutdown;
                    seen.lock().unwrap().push(request);
                    if shutdown {
                        break;
                    }
                }
            })
        })
    }

    fn collect_until_terminal(owner: &OwnerHandle, timeout: Duration) -> Vec<SignalRecord> {
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        loop {
            records.extend(owner.drain());
            if records.last().is_some_and(SignalRecord::is_terminal) {
                return records;
            }
            assert!(
                Instant::now() < deadline,
                "no terminal record, got {records:?}"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn kinds(records: &[SignalRecord]) -> Vec<SignalKind> {
        records.iter().map(SignalRecord::kind).collect()
    }

    fn assert_single_terminal_last(records: &[SignalRecord]) {
        let terminals = records.iter().filter(|r| r.is_terminal()).count();
        assert_eq!(terminals, 1, "{records:?}");
        assert!(records.last().unwrap().is_terminal());
    }

    #[test]
    fn echo_in_reader_mode() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/echo", ["hello"], b"").unwrap();

        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
        let records = owner.drain();
        assert_eq!(
            kinds(&records),
            vec![
                SignalKind::Started,
                SignalKind::DataAvailable,
                SignalKind::Completed
            ]
        );
        assert_eq!(
            records[1],
            SignalRecord::DataAvailable {
                stdout: b"hello\n".to_vec(),
                stderr: Vec::new(),
            }
        );
        assert_eq!(
            records[2],
            SignalRecord::Completed {
                exit_code: 0,
                exit_status: crate::bridge::protocol::ExitStatus::Normal,
            }
        );
        assert_eq!(owner.state(), ProcessState::NotRunning);
        assert!(owner.pid().is_some());
        assert_eq!(launcher.connection_state(), ConnectionState::Ready);
    }

    #[test]
    fn nonexistent_executable_fails_once() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        owner
            .start("/nonexistent/definitely-not-here", Vec::<String>::new(), b"")
            .unwrap();

        assert_eq!(owner.wait_for(SignalKind::Started, LONG), Ok(true));
        let records = owner.drain();
        assert_eq!(kinds(&records), vec![SignalKind::Failure]);
        assert_eq!(owner.state(), ProcessState::NotRunning);
        assert!(owner.is_terminal());
        assert_eq!(owner.failure_kind(), Some(FailureKind::StartFailure));
        assert_eq!(owner.exit_code(), 255);
        assert!(owner.pid().is_none());
    }

    #[test]
    fn writer_mode_streams_input() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Writer);
        owner
            .start("/bin/sh", ["-c", "read line; echo got $line"], b"")
            .unwrap();

        assert_eq!(owner.wait_for(SignalKind::Started, LONG), Ok(true));
        assert_eq!(owner.write(b"ping\n"), Ok(5));
        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
        assert_eq!(owner.read_all_stdout(), b"got ping\n");
        assert_eq!(owner.exit_code(), 0);
    }

    #[test]
    fn stdin_payload_in_reader_mode() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/cat", Vec::<String>::new(), b"payload").unwrap();

        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
        assert_eq!(owner.read_all_stdout(), b"payload");
    }

    #[test]
    fn cancel_before_started_yields_one_terminal() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/sleep", ["30"], b"").unwrap();
        owner.cancel();

        let records = collect_until_terminal(&owner, LONG);
        assert_single_terminal_last(&records);

        // Nothing more shows up afterwards.
        std::thread::sleep(Duration::from_millis(100));
        assert!(owner.drain().is_empty());
        assert_eq!(owner.state(), ProcessState::NotRunning);
    }

    #[test]
    fn cancel_ends_concurrent_wait_promptly() {
        let launcher = in_process();
        let owner = Arc::new(launcher.register(ProcessMode::Reader));
        owner.start("/bin/sleep", ["30"], b"").unwrap();
        assert_eq!(owner.wait_for(SignalKind::Started, LONG), Ok(true));

        let canceler = {
            let owner = Arc::clone(&owner);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                owner.cancel();
            })
        };

        let begin = Instant::now();
        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(false));
        assert!(begin.elapsed() < Duration::from_secs(10));
        canceler.join().unwrap();

        let records = collect_until_terminal(&owner, LONG);
        assert_single_terminal_last(&records);
    }

    #[test]
    fn wait_after_terminal_returns_true() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/true", Vec::<String>::new(), b"").unwrap();
        collect_until_terminal(&owner, LONG);

        let begin = Instant::now();
        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
        assert_eq!(owner.wait_for(SignalKind::DataAvailable, LONG), Ok(true));
        assert!(begin.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancel_twice_on_terminal_is_noop() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/true", Vec::<String>::new(), b"").unwrap();
        collect_until_terminal(&owner, LONG);

        owner.cancel();
        owner.cancel();
        std::thread::sleep(Duration::from_millis(100));
        assert!(owner.drain().is_empty());
        assert_eq!(owner.state(), ProcessState::NotRunning);
    }

    #[test]
    fn many_owner_threads_share_one_launcher() {
        let launcher = Arc::new(in_process());
        let workers: Vec<_> = (0..8)
            .map(|i| {
                let launcher = Arc::clone(&launcher);
                std::thread::spawn(move || {
                    let owner = launcher.register(ProcessMode::Reader);
                    let text = format!("run {i}");
                    owner.start("/bin/echo", [text.clone()], b"").unwrap();
                    assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
                    assert_eq!(owner.read_all_stdout(), format!("{text}\n").into_bytes());
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn write_before_started_sends_nothing() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut launcher = scripted(recording(Arc::clone(&seen)));
        let owner = launcher.register(ProcessMode::Writer);
        owner.start("/bin/cat", Vec::<String>::new(), b"").unwrap();

        assert_eq!(owner.write(b"too early"), Err(UsageError::NotRunning));
        launcher.shutdown().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2, "{seen:?}");
        assert!(matches!(seen[0], HelperRequest::StartProcess { .. }));
        assert_eq!(seen[1], HelperRequest::Shutdown);
    }

    #[test]
    fn shutdown_fails_active_processes() {
        let mut launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/sleep", ["30"], b"").unwrap();
        assert_eq!(owner.wait_for(SignalKind::Started, LONG), Ok(true));

        assert_eq!(launcher.shutdown(), Ok(()));
        assert_eq!(launcher.shutdown(), Ok(()));

        let records = owner.drain();
        assert_single_terminal_last(&records);
        assert_eq!(owner.last_error().as_deref(), Some(LAUNCHER_SHUT_DOWN));
        assert_eq!(launcher.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn start_during_shutdown_reaches_terminal() {
        // Keeps its end open after Shutdown, so shutdown waits out its timeout.
        let script: Script = Box::new(|stream: UnixStream| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let mut reader = FramedRead::new(stream, JsonCodec::<HelperRequest>::new());
                while let Some(Ok(_)) = reader.next().await {}
                std::future::pending::<()>().await;
            })
        });
        let mut launcher = Launcher::start(
            LauncherConfig::new()
                .with_spawner(Arc::new(ScriptedSpawner(script)))
                .with_shutdown_timeout(Duration::from_millis(1500)),
        )
        .unwrap();
        let owner = launcher.register(ProcessMode::Reader);

        let deadline = Instant::now() + LONG;
        while launcher.connection_state() != ConnectionState::Ready {
            assert!(Instant::now() < deadline, "helper never connected");
            std::thread::sleep(Duration::from_millis(10));
        }

        let stopper = std::thread::spawn(move || {
            launcher.shutdown().unwrap();
            launcher
        });
        std::thread::sleep(Duration::from_millis(300));

        owner.start("/bin/sleep", ["10"], b"").unwrap();
        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
        assert_eq!(owner.state(), ProcessState::NotRunning);
        assert_eq!(owner.failure_kind(), Some(FailureKind::Transport));
        assert_single_terminal_last(&owner.drain());

        let launcher = stopper.join().unwrap();
        assert_eq!(launcher.connection_state(), ConnectionState::Closed);
    }

    #[test]
    fn shutdown_on_launcher_thread_is_refused() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let mut launcher = Launcher {
            commands,
            connection: Arc::new(AtomicU8::new(0)),
            worker: Some(std::thread::spawn(|| {})),
            worker_thread: std::thread::current().id(),
        };

        assert_eq!(launcher.shutdown(), Err(UsageError::WorkerThread));
        assert!(launcher.worker.is_some());
        assert!(rx.try_recv().is_err());

        drop(launcher);
        assert!(matches!(rx.try_recv(), Ok(Command::Shutdown)));
    }

    #[test]
    fn start_after_shutdown_fails_on_handle() {
        let mut launcher = in_process();
        launcher.shutdown().unwrap();

        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/true", Vec::<String>::new(), b"").unwrap();
        assert!(owner.is_terminal());
        assert_eq!(owner.failure_kind(), Some(FailureKind::Transport));
    }

    #[test]
    fn disconnect_fails_each_active_token_once() {
        let launcher = scripted(Box::new(|stream: UnixStream| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let (read_half, write_half) = stream.into_split();
                let mut reader = FramedRead::new(read_half, JsonCodec::<HelperRequest>::new());
                let mut writer = FramedWrite::new(write_half, JsonCodec::<HelperResponse>::new());
                let mut started = 0;
                while let Some(Ok(request)) = reader.next().await {
                    if let HelperRequest::StartProcess { token, .. } = request {
                        writer
                            .send(HelperResponse::StartedAck { token, pid: 1000 + started })
                            .await
                            .unwrap();
                        started += 1;
                        if started == 3 {
                            break;
                        }
                    }
                }
                // Dropping both halves closes the connection.
            })
        }));

        let idle = launcher.register(ProcessMode::Reader);
        let owners: Vec<_> = (0..3)
            .map(|_| {
                let owner = launcher.register(ProcessMode::Reader);
                owner.start("/bin/sleep", ["30"], b"").unwrap();
                owner
            })
            .collect();

        for owner in &owners {
            let records = collect_until_terminal(owner, LONG);
            assert_single_terminal_last(&records);
            assert_eq!(
                records.last().unwrap(),
                &SignalRecord::Failure {
                    kind: FailureKind::Transport,
                    error: SOCKET_CLOSED.to_string(),
                }
            );
        }

        std::thread::sleep(Duration::from_millis(100));
        assert!(idle.drain().is_empty());
        assert!(!idle.is_terminal());
        assert_eq!(launcher.connection_state(), ConnectionState::Closed);

        // The closed channel fails new starts right away.
        idle.start("/bin/true", Vec::<String>::new(), b"").unwrap();
        let records = collect_until_terminal(&idle, LONG);
        assert_eq!(kinds(&records), vec![SignalKind::Failure]);
    }

    #[test]
    fn garbage_frame_is_protocol_failure() {
        let launcher = scripted(Box::new(|mut stream: UnixStream| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let mut buf = [0u8; 1];
                // Wait for the first request before answering with junk.
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
                let _ = stream.write_all(&[0, 0, 0, 3, b'x', b'y', b'z']).await;
                // Hold the connection open; the launcher closes it.
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut Vec::new()).await;
            })
        }));

        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/true", Vec::<String>::new(), b"").unwrap();

        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
        assert_eq!(owner.failure_kind(), Some(FailureKind::Protocol));
        assert_eq!(owner.last_error().as_deref(), Some(INVALID_PACKET));
    }

    #[test]
    fn oversized_frame_is_protocol_failure() {
        let launcher = scripted(Box::new(|mut stream: UnixStream| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let mut buf = [0u8; 1];
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
                let _ = stream.write_all(&u32::MAX.to_be_bytes()).await;
                let _ = tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut Vec::new()).await;
            })
        }));

        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/true", Vec::<String>::new(), b"").unwrap();

        assert_eq!(owner.wait_for(SignalKind::Completed, LONG), Ok(true));
        assert_eq!(owner.failure_kind(), Some(FailureKind::Protocol));
        assert_eq!(owner.last_error().as_deref(), Some(OVERSIZED_PACKET));
    }

    #[test]
    fn cancel_while_connecting_retracts_start() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let spawner = SlowSpawner(
            Duration::from_millis(500),
            ScriptedSpawner(recording(Arc::clone(&seen))),
        );
        let launcher =
            Launcher::start(LauncherConfig::new().with_spawner(Arc::new(spawner))).unwrap();

        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/sleep", ["30"], b"").unwrap();
        owner.cancel();

        let records = collect_until_terminal(&owner, LONG);
        assert_eq!(
            records,
            vec![SignalRecord::Failure {
                kind: FailureKind::StartFailure,
                error: CANCELED_BEFORE_START.to_string(),
            }]
        );
        drop(launcher);
        assert!(
            seen.lock()
                .unwrap()
                .iter()
                .all(|r| !matches!(r, HelperRequest::StartProcess { .. }))
        );
    }

    #[test]
    fn connect_failure_fails_started_processes() {
        let launcher = Launcher::start(
            LauncherConfig::new()
                .with_spawner(Arc::new(FailingSpawner))
                .with_thread_name("proclaunch-test"),
        )
        .unwrap();
        let owner = launcher.register(ProcessMode::Reader);
        owner.start("/bin/true", Vec::<String>::new(), b"").unwrap();

        let records = collect_until_terminal(&owner, LONG);
        assert_eq!(kinds(&records), vec![SignalKind::Failure]);
        assert_eq!(owner.failure_kind(), Some(FailureKind::Transport));
        assert!(owner.last_error().unwrap().contains("no helper here"));
    }

    #[test]
    fn wait_on_launcher_thread_is_usage_error() {
        let slot: Arc<Mutex<Option<Arc<OwnerHandle>>>> = Arc::new(Mutex::new(None));
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let script_slot = Arc::clone(&slot);
        let result_tx = Mutex::new(result_tx);
        let launcher = scripted(Box::new(move |stream: UnixStream| -> BoxFuture<'static, ()> {
            let slot = Arc::clone(&script_slot);
            let result_tx = result_tx.lock().unwrap().clone();
            Box::pin(async move {
                let mut reader = FramedRead::new(stream, JsonCodec::<HelperRequest>::new());
                if let Some(Ok(HelperRequest::StartProcess { .. })) = reader.next().await {
                    let owner = slot.lock().unwrap().take().unwrap();
                    let _ = result_tx.send(owner.wait_for(SignalKind::Started, LONG));
                }
            })
        }));

        let owner = Arc::new(launcher.register(ProcessMode::Reader));
        *slot.lock().unwrap() = Some(Arc::clone(&owner));
        owner.start("/bin/true", Vec::<String>::new(), b"").unwrap();

        let result = result_rx.recv_timeout(LONG).unwrap();
        assert_eq!(result, Err(UsageError::WorkerThread));
    }

    #[tokio::test]
    async fn async_owner_is_notified() {
        let launcher = in_process();
        let owner = launcher.register(ProcessMode::Reader);
        let signals = owner.signals();
        owner.start("/bin/echo", ["async"], b"").unwrap();

        tokio::time::timeout(LONG, async {
            while !owner.is_terminal() {
                signals.notified().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(owner.read_all_stdout(), b"async\n");
    }

    #[test]
    fn config_from_lookup() {
        let config = LauncherConfig::from_lookup(|key| match key {
            "PROCLAUNCH_CONNECT_TIMEOUT_MS" => Some("250".to_string()),
            "PROCLAUNCH_SHUTDOWN_TIMEOUT_MS" => Some("soon".to_string()),
            _ => None,
        });
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.thread_name, "proclaunch");
    }

    #[test]
    fn worker_thread_is_not_the_caller() {
        let launcher = in_process();
        assert_ne!(launcher.worker_thread_id(), std::thread::current().id());
    }
}
