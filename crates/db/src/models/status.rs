//! Status enums mapping to PostgreSQL enum types.
//!
//! Each enum's variants serialise to the lowercase label used by the
//! corresponding database type (`server_status`, `channel_status`, ...),
//! so the same string is seen by sqlx, serde and the dashboard.

use std::fmt;
use std::str::FromStr;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident : $pg_type:literal {
            $( $(#[$vmeta:meta])* $variant:ident = $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash,
            serde::Serialize, serde::Deserialize, sqlx::Type,
        )]
        #[sqlx(type_name = $pg_type, rename_all = "lowercase")]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$( $name::$variant ),+];

            /// Return the database label.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label ),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $label => Ok($name::$variant), )+
                    other => Err(format!(
                        concat!("Unknown ", stringify!($name), " '{}'"),
                        other
                    )),
                }
            }
        }
    };
}

define_status_enum! {
    /// Agent connectivity, driven by heartbeats.
    ServerStatus: "server_status" {
        Online = "online",
        Offline = "offline",
        Connecting = "connecting",
    }
}

define_status_enum! {
    /// Relay lifecycle state of a channel.
    ChannelStatus: "channel_status" {
        Running = "running",
        Stopped = "stopped",
        Error = "error",
        Starting = "starting",
        Stopping = "stopping",
    }
}

define_status_enum! {
    /// Capture and rewrap lifecycle of a recording.
    RecordingStatus: "recording_status" {
        Recording = "recording",
        Stopped = "stopped",
        Processing = "processing",
        Completed = "completed",
        Error = "error",
    }
}

define_status_enum! {
    /// Command queue status. Monotonic: pending -> processing -> completed|failed.
    CommandStatus: "command_status" {
        Pending = "pending",
        Processing = "processing",
        Completed = "completed",
        Failed = "failed",
    }
}

define_status_enum! {
    /// Severity of a server log entry.
    LogLevel: "log_level" {
        Info = "info",
        Warn = "warn",
        Error = "error",
        Debug = "debug",
    }
}

impl ChannelStatus {
    /// Statuses during which a relay process exists and `pid` is set.
    pub fn has_process(self) -> bool {
        matches!(
            self,
            ChannelStatus::Starting | ChannelStatus::Running | ChannelStatus::Stopping
        )
    }
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::Completed | CommandStatus::Failed)
    }
}
