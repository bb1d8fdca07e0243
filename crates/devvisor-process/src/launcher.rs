//! Child launching and the IPC channel
//!
//! The parent binds a loopback listener per child and hands its address to
//! the child through [`env::IPC_ADDR`]. The first connection accepted on that
//! listener becomes the child's message channel.

use std::path::PathBuf;
use std::process::Stdio;

use devvisor_protocol::{decode_line, encode_line, env, ChildMessage, ParentMessage};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    child::{ChildProcess, CommandChild},
    error::Result,
};

/// Boxed child output stream
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Everything needed to start one child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Added to the parent environment, later entries win
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// Last value set for an environment variable
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Inbound traffic from the child
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(ChildMessage),
    /// The channel could not be established
    Failed(String),
}

/// Parent end of a child's message channel
#[derive(Debug)]
pub struct IpcChannel {
    pub inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    pub outbound: mpsc::UnboundedSender<ParentMessage>,
    /// Task serving the transport, aborted when the child exits
    pub task: Option<AbortHandle>,
}

/// Child end of an in-process channel pair
#[derive(Debug)]
pub struct IpcPeer {
    pub inbound: mpsc::UnboundedSender<ChannelEvent>,
    pub outbound: mpsc::UnboundedReceiver<ParentMessage>,
}

impl IpcChannel {
    /// Create a connected channel pair
    pub fn pair() -> (IpcChannel, IpcPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            IpcChannel {
                inbound: inbound_rx,
                outbound: outbound_tx,
                task: None,
            },
            IpcPeer {
                inbound: inbound_tx,
                outbound: outbound_rx,
            },
        )
    }
}

/// A freshly started child
pub struct Launched {
    pub process: Box<dyn ChildProcess>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
    pub channel: IpcChannel,
}

/// Starts child processes
pub trait Launcher: Send + Sync {
    /// Start a child; must be called from within a tokio runtime
    fn launch(&self, spec: LaunchSpec) -> Result<Launched>;
}

/// Launches real OS processes
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for CommandLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<Launched> {
        debug!(
            command = %spec.command,
            args = ?spec.args,
            "Spawning process"
        );

        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        listener.set_nonblocking(true)?;
        let ipc_addr = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;

        // Build command
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env(env::IPC_ADDR, ipc_addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so the whole tree can be killed at once
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputStream);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputStream);

        let (mut channel, peer) = IpcChannel::pair();
        let task = tokio::spawn(serve_channel(listener, peer));
        channel.task = Some(task.abort_handle());

        let process = CommandChild::new(child);
        info!(pid = ?process.id(), command = %spec.command, "Process spawned");

        Ok(Launched {
            process: Box::new(process),
            stdout,
            stderr,
            channel,
        })
    }
}

async fn serve_channel(listener: TcpListener, peer: IpcPeer) {
    let IpcPeer {
        inbound,
        mut outbound,
    } = peer;

    let stream = match listener.accept().await {
        Ok((stream, remote)) => {
            debug!(remote = %remote, "Child connected to IPC channel");
            stream
        }
        Err(e) => {
            warn!(error = %e, "Failed to accept child IPC connection");
            let _ = inbound.send(ChannelEvent::Failed(e.to_string()));
            return;
        }
    };
    drop(listener);

    let (read_half, mut write_half) = stream.into_split();

    let reader = async move {
        let mut lines = BufReader::new(read_half).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(message) = decode_line::<ChildMessage>(&line) {
                        if inbound.send(ChannelEvent::Message(message)).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "IPC channel closed");
                    break;
                }
            }
        }
    };

    let writer = async move {
        while let Some(message) = outbound.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode parent message");
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(line.as_bytes()).await {
                debug!(error = %e, "Failed to write to child IPC channel");
                break;
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = writer => {}
    }
}
