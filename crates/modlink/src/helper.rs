//! Helper-process side of the bridge: command registry, request loop,
//! and parent-liveness monitoring.
//!
//! The loop alternates between two states: idle (reading the next
//! request frame) and executing (one handler running). Every request
//! produces exactly one reply before the next frame is read. Command
//! failures are data — converted to error replies — and never end the
//! loop; the loop ends on stdin EOF, and the liveness monitor ends the
//! whole process when the parent dies.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::{self, JsonLineCodec};
use crate::bridge::protocol::{HANDSHAKE_DEBUG, HANDSHAKE_OK, Reply, unpack_args};

const PARENT_POLL_INTERVAL: Duration = Duration::from_secs(2);

type CommandHandler = Box<dyn Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync>;

/// Static mapping from command name to handler, fixed before the loop
/// starts.
///
/// Handlers receive the positional arguments in order and validate
/// their own arity and types; whatever they return travels back as the
/// reply value, and an `Err` becomes the reply's error text.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandHandler>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.commands.insert(name.into(), Box::new(handler));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    fn get(&self, name: &str) -> Option<&CommandHandler> {
        self.commands.get(name)
    }
}

/// Command-line contract: `helper <parent_pid> [--debug]`.
#[derive(Debug, Clone, PartialEq)]
pub struct HelperArgs {
    pub parent_pid: i32,
    pub debug: bool,
}

pub fn parse_args<I>(args: I) -> Result<HelperArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();

    let pid_arg = args.next().ok_or("missing parent pid argument")?;
    let parent_pid = pid_arg
        .parse::<i32>()
        .map_err(|_| format!("invalid parent pid {:?}", pid_arg))?;

    let mut debug = false;
    for arg in args {
        match arg.as_str() {
            "--debug" => debug = true,
            other => return Err(format!("unknown argument {:?}", other)),
        }
    }

    Ok(HelperArgs { parent_pid, debug })
}

/// Report a startup failure through the handshake so the bridge's init
/// fails with the error text, then let the caller exit.
pub async fn write_startup_failure<W>(writer: W, message: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = FramedWrite::new(writer, JsonLineCodec::new());
    codec::write_handshake(&mut writer, message).await
}

/// Run the helper side of the bridge: emit the handshake, then serve
/// requests one at a time until the input closes.
pub async fn run_helper<R, W>(
    reader: R,
    writer: W,
    registry: CommandRegistry,
    debug: bool,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, JsonLineCodec::new());
    let mut writer = FramedWrite::new(writer, JsonLineCodec::new());

    let status = if debug { HANDSHAKE_DEBUG } else { HANDSHAKE_OK };
    codec::write_handshake(&mut writer, status).await?;
    tracing::info!(status, "Helper ready");

    loop {
        // EOF on the id line is the clean end of the stream (parent
        // closed the pipe); EOF anywhere later is a torn frame.
        let id_value = match codec::next_value(&mut reader).await? {
            Some(value) => value,
            None => break,
        };
        let request_id = id_value.as_str().map(str::to_string).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request id must be a string, got {}", id_value),
            )
        })?;

        let command_value = require(&mut reader, "command id").await?;
        let args_value = require(&mut reader, "argument payload").await?;

        let reply = match command_value.as_str() {
            None => Reply::error(
                &request_id,
                format!("malformed request: command id must be a string, got {}", command_value),
            ),
            Some(command) => {
                if debug {
                    tracing::debug!(%request_id, command, "Executing command");
                }
                execute(&registry, &request_id, command, &args_value)
            }
        };

        codec::write_reply(&mut writer, &reply).await?;
    }

    tracing::info!("Helper input closed, exiting command loop");
    Ok(())
}

fn execute(registry: &CommandRegistry, request_id: &str, command: &str, args: &Value) -> Reply {
    let args = match unpack_args(args) {
        Ok(args) => args,
        Err(e) => return Reply::error(request_id, format!("malformed request: {}", e)),
    };

    let Some(handler) = registry.get(command) else {
        return Reply::error(request_id, format!("not found: {}", command));
    };

    match handler(args) {
        Ok(value) => Reply::ok(request_id, value),
        Err(e) => {
            tracing::warn!(command, error = %e, "Command failed");
            Reply::error(request_id, e.to_string())
        }
    }
}

async fn require<R>(reader: &mut FramedRead<R, JsonLineCodec>, what: &str) -> io::Result<Value>
where
    R: AsyncRead + Unpin,
{
    codec::next_value(reader).await?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("pipe closed while waiting for {}", what),
        )
    })
}

/// Start the parent-liveness monitor: a dedicated thread that polls the
/// parent pid and exits the whole process once it is gone.
///
/// Deliberately independent of the command loop — a helper stuck in a
/// long command still goes away with its parent.
pub fn spawn_parent_monitor(parent_pid: i32) {
    std::thread::spawn(move || {
        loop {
            if !parent_alive(parent_pid) {
                tracing::info!(parent_pid, "Parent process exited, shutting down");
                std::process::exit(0);
            }
            std::thread::sleep(PARENT_POLL_INTERVAL);
        }
    });
}

#[cfg(unix)]
fn parent_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Signal 0 probes existence. EPERM still proves the pid is alive.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn parent_alive(_pid: i32) -> bool {
    // No liveness probe on this platform; stdin EOF in the command loop
    // is the termination path.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{next_value, read_handshake, read_reply, write_request};
    use crate::bridge::protocol::Request;
    use serde_json::json;

    fn echo_registry() -> CommandRegistry {
        let mut registry = CommandRegistry::new();
        registry.register("echo", |args| {
            args.into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("echo takes one argument"))
        });
        registry.register("fail", |_| Err(anyhow::anyhow!("mod scan exploded")));
        registry
    }

    #[test]
    fn parse_args_accepts_pid_and_debug_flag() {
        let args = parse_args(vec!["4242".to_string(), "--debug".to_string()]).unwrap();
        assert_eq!(
            args,
            HelperArgs {
                parent_pid: 4242,
                debug: true
            }
        );

        let plain = parse_args(vec!["1".to_string()]).unwrap();
        assert!(!plain.debug);
    }

    #[test]
    fn parse_args_rejects_bad_input() {
        assert!(parse_args(vec![]).unwrap_err().contains("missing parent pid"));
        assert!(
            parse_args(vec!["abc".to_string()])
                .unwrap_err()
                .contains("invalid parent pid")
        );
        assert!(
            parse_args(vec!["1".to_string(), "--verbose".to_string()])
                .unwrap_err()
                .contains("unknown argument")
        );
    }

    #[test]
    fn registry_lookup() {
        let registry = echo_registry();
        assert!(registry.contains("echo"));
        assert!(!registry.contains("nope"));
    }

    async fn start_loop() -> (
        FramedWrite<tokio::io::WriteHalf<tokio::io::SimplexStream>, JsonLineCodec>,
        FramedRead<tokio::io::ReadHalf<tokio::io::SimplexStream>, JsonLineCodec>,
    ) {
        let (helper_read, ui_write) = tokio::io::simplex(4096);
        let (ui_read, helper_write) = tokio::io::simplex(4096);
        tokio::spawn(async move {
            let _ = run_helper(helper_read, helper_write, echo_registry(), false).await;
        });

        let writer = FramedWrite::new(ui_write, JsonLineCodec::new());
        let mut reader = FramedRead::new(ui_read, JsonLineCodec::new());

        let handshake = read_handshake(&mut reader).await.unwrap();
        assert_eq!(handshake.value, json!("ok"));
        (writer, reader)
    }

    #[tokio::test]
    async fn serves_requests_and_survives_command_errors() {
        let (mut writer, mut reader) = start_loop().await;

        write_request(&mut writer, &Request::new("r1", "fail", vec![]))
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("r1"));
        assert_eq!(reply.status.unwrap().error, "mod scan exploded");

        // Loop is back in idle state and keeps serving.
        write_request(&mut writer, &Request::new("r2", "echo", vec![json!("after")]))
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("r2"));
        assert_eq!(reply.value, json!("after"));
        assert!(reply.status.is_none());
    }

    #[tokio::test]
    async fn unknown_command_gets_not_found_without_executing() {
        let (mut writer, mut reader) = start_loop().await;

        write_request(&mut writer, &Request::new("r1", "nope", vec![json!(1)]))
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply.status.unwrap().error, "not found: nope");
        assert_eq!(reply.value, Value::Null);
    }

    #[tokio::test]
    async fn malformed_argument_payload_gets_error_reply() {
        let (mut writer, mut reader) = start_loop().await;

        // Hand-rolled frame with an array payload instead of the
        // Item1..ItemN record.
        use futures::SinkExt;
        writer.feed(json!("r1")).await.unwrap();
        writer.feed(json!("echo")).await.unwrap();
        writer.send(json!(["positional"])).await.unwrap();

        let reply = read_reply(&mut reader).await.unwrap();
        assert_eq!(reply.request_id.as_deref(), Some("r1"));
        assert!(reply.status.unwrap().error.starts_with("malformed request:"));
    }

    #[tokio::test]
    async fn input_eof_ends_the_loop_cleanly() {
        let (helper_read, ui_write) = tokio::io::simplex(4096);
        let (ui_read, helper_write) = tokio::io::simplex(4096);

        let loop_task = tokio::spawn(async move {
            run_helper(helper_read, helper_write, echo_registry(), false).await
        });

        let mut reader = FramedRead::new(ui_read, JsonLineCodec::new());
        read_handshake(&mut reader).await.unwrap();

        drop(ui_write);
        assert!(loop_task.await.unwrap().is_ok());
        assert!(next_value(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn startup_failure_travels_through_the_handshake() {
        let (ui_read, helper_write) = tokio::io::simplex(4096);
        write_startup_failure(helper_write, "invalid parent pid \"abc\"")
            .await
            .unwrap();

        let mut reader = FramedRead::new(ui_read, JsonLineCodec::new());
        let handshake = read_handshake(&mut reader).await.unwrap();
        assert_eq!(handshake.request_id, None);
        assert_eq!(handshake.value, json!("invalid parent pid \"abc\""));
    }

    #[test]
    fn own_process_is_alive() {
        assert!(parent_alive(std::process::id() as i32));
    }
}
