//! Command queue lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// State of a queued site command.
///
/// The lifecycle is `Enqueued -> Working -> Done | Canceled`, where a
/// command already in `Working` may be claimed again after a poller loses
/// its lease (the resend counter tracks this).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandState {
    /// Submitted and waiting for a poller to claim it.
    Enqueued,
    /// Claimed by a poller; may be re-claimed after lease expiry.
    Working,
    /// Completed with a response.
    Done,
    /// Canceled before completion.
    Canceled,
}

impl CommandState {
    /// The four-character state code stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "ENQD",
            Self::Working => "WORK",
            Self::Done => "DONE",
            Self::Canceled => "CNCL",
        }
    }

    /// Check if the command can still be claimed by a poller.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Enqueued | Self::Working)
    }

    /// Check if the command reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Canceled)
    }
}

impl FromStr for CommandState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "ENQD" => Ok(Self::Enqueued),
            "WORK" => Ok(Self::Working),
            "DONE" => Ok(Self::Done),
            "CNCL" => Ok(Self::Canceled),
            other => Err(crate::Error::InvalidCommandState(other.to_string())),
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
