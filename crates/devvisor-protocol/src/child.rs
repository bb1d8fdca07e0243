//! Child-side client
//!
//! The child connects back to the address the supervisor put in
//! [`env::IPC_ADDR`]. Writes are blocking and serialized behind a mutex so
//! they are usable from a panic hook; parent messages are read on a
//! dedicated thread.

use std::{
    io::{BufRead, BufReader, Write},
    net::TcpStream,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
    thread,
};

use tracing::{debug, warn};

use crate::{
    codec::{decode_line, encode_line},
    env,
    error::Result,
    geometry::TerminalGeometry,
    message::{ChildMessage, ErrorReport, ModuleImported, ParentMessage},
};

/// How the child should treat its output stream
///
/// Under the supervisor the child's stdout is a pipe, but the parent relays it
/// to a real terminal. `Forwarded` tells the child to render for that
/// terminal; the geometry stays current as the parent forwards resizes.
#[derive(Debug, Clone)]
pub enum TerminalMode {
    Forwarded(Arc<RwLock<TerminalGeometry>>),
    Detached,
}

impl TerminalMode {
    /// Build the mode from the spawn-time environment
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_geometry(TerminalGeometry::from_env()?))
    }

    pub fn from_geometry(geometry: Option<TerminalGeometry>) -> Self {
        match geometry {
            Some(geometry) => TerminalMode::Forwarded(Arc::new(RwLock::new(geometry))),
            None => TerminalMode::Detached,
        }
    }

    /// Whether output should be rendered as if a terminal were attached
    pub fn is_terminal(&self) -> bool {
        matches!(self, TerminalMode::Forwarded(_))
    }

    /// Current terminal size, if forwarded
    pub fn geometry(&self) -> Option<TerminalGeometry> {
        match self {
            TerminalMode::Forwarded(shared) => Some(*shared.read().unwrap_or_else(|p| p.into_inner())),
            TerminalMode::Detached => None,
        }
    }

    fn apply(&self, geometry: TerminalGeometry) {
        if let TerminalMode::Forwarded(shared) = self {
            *shared.write().unwrap_or_else(|p| p.into_inner()) = geometry;
        }
    }
}

/// Connection from a supervised child back to its parent
#[derive(Debug)]
pub struct ChildLink {
    writer: Mutex<TcpStream>,
    terminal: TerminalMode,
}

impl ChildLink {
    /// Connect using the supervisor's environment
    ///
    /// Returns `Ok(None)` when the process is not running under devvisor.
    pub fn from_env() -> Result<Option<Arc<Self>>> {
        let Ok(addr) = std::env::var(env::IPC_ADDR) else {
            return Ok(None);
        };
        let terminal = TerminalMode::from_env()?;
        Self::connect(&addr, terminal).map(Some)
    }

    /// Connect to an explicit parent address
    pub fn connect(addr: &str, terminal: TerminalMode) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let link = Arc::new(Self {
            writer: Mutex::new(stream),
            terminal: terminal.clone(),
        });

        thread::Builder::new()
            .name("devvisor-ipc".to_string())
            .spawn(move || read_parent_messages(reader, terminal))?;

        debug!(addr = %addr, "Connected to devvisor parent");
        Ok(link)
    }

    pub fn terminal(&self) -> &TerminalMode {
        &self.terminal
    }

    /// Report a newly loaded source file so the parent starts watching it
    pub fn module_imported(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.send(&ChildMessage::ModuleImported(ModuleImported {
            file_path: path.into(),
        }))
    }

    /// Report an uncaught error
    pub fn report_error(
        &self,
        error: impl Into<String>,
        stack: Option<String>,
        will_terminate: bool,
    ) -> Result<()> {
        self.send(&ChildMessage::Error(ErrorReport {
            error: error.into(),
            stack,
            will_terminate,
        }))
    }

    /// Signal that the server accepts connections
    pub fn server_listening(&self) -> Result<()> {
        self.send(&ChildMessage::AppServerListening {})
    }

    /// Report panics to the parent before running the previous hook
    ///
    /// Panics are reported with `will_terminate = false`: the parent decides
    /// whether the child gets replaced.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let link = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let stack = std::backtrace::Backtrace::capture().to_string();
            let stack = (!stack.is_empty()).then_some(stack);
            if let Err(e) = link.report_error(info.to_string(), stack, false) {
                eprintln!("devvisor: failed to report panic: {}", e);
            }
            previous(info);
        }));
    }

    fn send(&self, message: &ChildMessage) -> Result<()> {
        let line = encode_line(message)?;
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        writer.write_all(line.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

fn read_parent_messages(stream: TcpStream, terminal: TerminalMode) {
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "devvisor parent channel closed");
                return;
            }
        };
        if let Some(ParentMessage::TtyResize(resize)) = decode_line::<ParentMessage>(&line) {
            terminal.apply(resize.into());
        }
    }
}
