//! Terminal geometry carried from parent to child

use serde::{Deserialize, Serialize};

use crate::{
    env,
    error::{ProtocolError, Result},
    message::TtyResize,
};

/// Terminal size in character cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalGeometry {
    pub columns: u16,
    pub rows: u16,
}

impl TerminalGeometry {
    pub fn new(columns: u16, rows: u16) -> Self {
        Self { columns, rows }
    }

    /// Environment pairs that seed the child's terminal size
    pub fn to_env(&self) -> [(&'static str, String); 2] {
        [
            (env::TTY_COLUMNS, self.columns.to_string()),
            (env::TTY_ROWS, self.rows.to_string()),
        ]
    }

    /// Read the geometry from the current process environment
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the geometry through an arbitrary variable lookup
    ///
    /// Returns `Ok(None)` when neither variable is set; a half-set or
    /// non-numeric pair is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Option<Self>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let columns = lookup(env::TTY_COLUMNS);
        let rows = lookup(env::TTY_ROWS);

        match (columns, rows) {
            (None, None) => Ok(None),
            (Some(columns), Some(rows)) => Ok(Some(Self {
                columns: parse_cells(env::TTY_COLUMNS, columns)?,
                rows: parse_cells(env::TTY_ROWS, rows)?,
            })),
            (None, Some(_)) => Err(ProtocolError::InvalidEnv {
                name: env::TTY_COLUMNS,
                value: String::new(),
            }),
            (Some(_), None) => Err(ProtocolError::InvalidEnv {
                name: env::TTY_ROWS,
                value: String::new(),
            }),
        }
    }
}

impl From<TtyResize> for TerminalGeometry {
    fn from(resize: TtyResize) -> Self {
        Self::new(resize.columns, resize.rows)
    }
}

impl From<TerminalGeometry> for TtyResize {
    fn from(geometry: TerminalGeometry) -> Self {
        TtyResize {
            columns: geometry.columns,
            rows: geometry.rows,
        }
    }
}

fn parse_cells(name: &'static str, value: String) -> Result<u16> {
    match value.trim().parse::<u16>() {
        Ok(cells) if cells > 0 => Ok(cells),
        _ => Err(ProtocolError::InvalidEnv { name, value }),
    }
}
