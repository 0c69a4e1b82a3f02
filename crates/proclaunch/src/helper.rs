//! Helper side of the launcher protocol.
//!
//! Runs inside the helper process (or on the launcher runtime for the
//! in-process spawner). Each StartProcess gets its own task that spawns the
//! child, forwards its output, and reports its exit.
//!
//! Per process, responses are produced in order: StartedAck, output chunks,
//! then exactly one ExitNotice or ErrorAck.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{
    ExitStatus, HelperRequest, HelperResponse, ProcessFault, ProcessMode, StartRequest, Token,
};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Exit code reported for a process that was stopped or died from a signal.
pub const CRASH_EXIT_CODE: i32 = -1;

type ResponseSender = mpsc::UnboundedSender<HelperResponse>;

struct RunningProcess {
    stdin: mpsc::UnboundedSender<Vec<u8>>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Serve one launcher connection until Shutdown or EOF.
pub async fn serve(stream: UnixStream) -> io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<HelperRequest>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<HelperResponse>::new());

    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<HelperResponse>();
    let writer_task = tokio::spawn(async move {
        while let Some(response) = response_rx.recv().await {
            if let Err(e) = writer.send(response).await {
                tracing::warn!(error = %e, "Failed to write response, dropping connection");
                break;
            }
        }
    });

    let (exited_tx, mut exited_rx) = mpsc::unbounded_channel::<Token>();
    let mut processes: HashMap<Token, RunningProcess> = HashMap::new();

    let result = loop {
        tokio::select! {
            request = reader.next() => match request {
                Some(Ok(HelperRequest::StartProcess { token, request })) => {
                    if processes.contains_key(&token) {
                        tracing::warn!(%token, "Start for a token that is already running");
                        let _ = response_tx.send(HelperResponse::ErrorAck {
                            token,
                            error: ProcessFault::FailedToStart,
                            message: format!("Token {token} is already in use."),
                        });
                        continue;
                    }
                    let process = start_process(token, request, response_tx.clone(), exited_tx.clone());
                    processes.insert(token, process);
                }
                Some(Ok(HelperRequest::WriteStdin { token, data })) => match processes.get(&token) {
                    Some(process) => {
                        if process.stdin.send(data).is_err() {
                            tracing::debug!(%token, "Stdin already closed, dropping write");
                        }
                    }
                    None => tracing::warn!(%token, "Write for unknown token"),
                },
                Some(Ok(HelperRequest::StopProcess { token })) => match processes.get(&token) {
                    Some(process) => {
                        tracing::debug!(%token, "Stopping process");
                        process.stop.cancel();
                    }
                    // The process may have exited while the stop was in flight.
                    None => tracing::debug!(%token, "Stop for unknown token"),
                },
                Some(Ok(HelperRequest::Shutdown)) => {
                    tracing::info!(running = processes.len(), "Shutdown requested");
                    break Ok(());
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Failed to read request");
                    break Err(io::Error::from(e));
                }
                None => {
                    tracing::debug!("Launcher closed connection");
                    break Ok(());
                }
            },
            Some(token) = exited_rx.recv() => {
                processes.remove(&token);
            }
        }
    };

    for (token, process) in processes.drain() {
        process.stop.cancel();
        if let Err(e) = process.task.await {
            tracing::warn!(%token, error = %e, "Process task failed");
        }
    }
    drop(response_tx);
    drop(reader);
    if let Err(e) = writer_task.await {
        tracing::warn!(error = %e, "Writer task failed");
    }

    result
}

fn start_process(
    token: Token,
    request: StartRequest,
    responses: ResponseSender,
    exited: mpsc::UnboundedSender<Token>,
) -> RunningProcess {
    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
    let stop = CancellationToken::new();
    let task = tokio::spawn({
        let stop = stop.clone();
        async move {
            run_process(token, request, &responses, stdin_rx, stop).await;
            let _ = exited.send(token);
        }
    });
    RunningProcess {
        stdin: stdin_tx,
        stop,
        task,
    }
}

async fn run_process(
    token: Token,
    request: StartRequest,
    responses: &ResponseSender,
    stdin_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: CancellationToken,
) {
    let stdin = match &request.standard_input_file {
        Some(path) => match tokio::fs::File::open(path).await {
            Ok(file) => Stdio::from(file.into_std().await),
            Err(e) => {
                let message = format!("Cannot open standard input file {}: {e}", path.display());
                fail_to_start(token, &request, responses, message);
                return;
            }
        },
        None => Stdio::piped(),
    };

    let mut command = Command::new(&request.program);
    command
        .args(&request.arguments)
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(environment) = &request.environment {
        command.env_clear().envs(environment);
    }
    if let Some(dir) = &request.working_directory {
        command.current_dir(dir);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            fail_to_start(token, &request, responses, e.to_string());
            return;
        }
    };

    let pid = child.id().unwrap_or(0);
    tracing::debug!(%token, pid, program = %request.program, "Process started");
    let _ = responses.send(HelperResponse::StartedAck { token, pid });

    if let Some(stdin) = child.stdin.take() {
        tokio::spawn(feed_stdin(token, stdin, request.write_data, request.mode, stdin_rx));
    } else {
        drop(stdin_rx);
    }
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let merge = request.merge_channels;
    let finished = async {
        if let Err(e) = tokio::try_join!(
            forward_output(token, stdout, false, responses),
            forward_output(token, stderr, !merge, responses),
        ) {
            return Err((ProcessFault::ReadFailed, e));
        }
        child.wait().await.map_err(|e| (ProcessFault::Crashed, e))
    };

    let outcome = tokio::select! {
        _ = stop.cancelled() => None,
        result = finished => Some(result),
    };

    let response = match outcome {
        None => {
            if let Err(e) = child.kill().await {
                tracing::debug!(%token, error = %e, "Kill failed, process already gone");
            }
            HelperResponse::ExitNotice {
                token,
                exit_code: CRASH_EXIT_CODE,
                exit_status: ExitStatus::Crashed,
            }
        }
        Some(Ok(status)) => match status.code() {
            Some(exit_code) => HelperResponse::ExitNotice {
                token,
                exit_code,
                exit_status: ExitStatus::Normal,
            },
            None => HelperResponse::ExitNotice {
                token,
                exit_code: CRASH_EXIT_CODE,
                exit_status: ExitStatus::Crashed,
            },
        },
        Some(Err((error, e))) => {
            tracing::warn!(%token, ?error, error_message = %e, "Process failed");
            if let Err(e) = child.kill().await {
                tracing::debug!(%token, error = %e, "Kill failed, process already gone");
            }
            HelperResponse::ErrorAck {
                token,
                error,
                message: e.to_string(),
            }
        }
    };
    tracing::debug!(%token, ?response, "Process finished");
    let _ = responses.send(response);
}

fn fail_to_start(token: Token, request: &StartRequest, responses: &ResponseSender, message: String) {
    tracing::debug!(%token, program = %request.program, error = %message, "Failed to start process");
    let _ = responses.send(HelperResponse::ErrorAck {
        token,
        error: ProcessFault::FailedToStart,
        message,
    });
}

async fn feed_stdin(
    token: Token,
    mut stdin: ChildStdin,
    initial: Vec<u8>,
    mode: ProcessMode,
    mut writes: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    if !initial.is_empty()
        && let Err(e) = stdin.write_all(&initial).await
    {
        tracing::debug!(%token, error = %e, "Failed to write initial stdin");
        return;
    }
    if mode == ProcessMode::Reader {
        return;
    }
    while let Some(data) = writes.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            tracing::debug!(%token, error = %e, "Failed to write stdin");
            return;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!(%token, error = %e, "Failed to flush stdin");
            return;
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(
    token: Token,
    source: Option<R>,
    as_stderr: bool,
    responses: &ResponseSender,
) -> io::Result<()> {
    let Some(mut source) = source else {
        return Ok(());
    };
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let data = buf[..n].to_vec();
        let response = if as_stderr {
            HelperResponse::StderrChunk { token, data }
        } else {
            HelperResponse::StdoutChunk { token, data }
        };
        // Keep draining after the connection is gone so the child never blocks.
        let _ = responses.send(response);
    }
}
