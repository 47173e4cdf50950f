//! Shared fixtures: an in-memory store, a temporary media root and shell
//! scripts standing in for the relay, capture, probe and remux tools.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use srtcast_agent::process::ExternalTool;
use srtcast_agent::{Agent, AgentConfig};
use srtcast_core::types::EntityId;
use srtcast_db::models::channel::{Channel, CreateChannel};
use srtcast_db::models::command::{Command, CreateCommand};
use srtcast_db::models::recording::Recording;
use srtcast_db::models::server::{CreateServer, Server};
use srtcast_db::{MemoryStore, Store};
use tempfile::TempDir;

pub const TOKEN: &str = "tok_agent_tests_0123456789";

/// A relay or capture that stays up until signalled.
pub const LONG_RUNNING: &str = "exec sleep 30";

/// Relay stand-in that prints one statistics line and then idles.
pub const RELAY_WITH_STATS: &str = r#"echo '{"recv":{"mbitRate":4.2,"packetsDropped":3},"send":{"mbitRate":4.1}}'
exec sleep 30"#;

/// Capture stand-in that writes a few bytes of "stream" and then idles.
pub const CAPTURE_WRITING: &str = "printf 'TS-PAYLOAD-BYTES'\nexec sleep 30";

/// Remux stand-in: copies the `-i` input to the last argument.
pub const REMUX_COPY: &str = r#"for last; do :; done
cp "$3" "$last""#;

pub const PROBE_JSON: &str = r#"{
  "programs": [
    {"program_id": 1, "pmt_pid": 4096, "pcr_pid": 256,
     "tags": {"service_name": "Sports 1", "service_provider": "Acme"}}
  ],
  "streams": [
    {"index": 0, "id": "0x100", "codec_name": "h264", "codec_type": "video",
     "width": 1920, "height": 1080, "bit_rate": "6000000"},
    {"index": 1, "id": "0x101", "codec_name": "aac", "codec_type": "audio",
     "bit_rate": "128000", "tags": {"language": "eng"}}
  ],
  "format": {"format_name": "mpegts", "bit_rate": "6300000"}
}"#;

pub struct TestEnv {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub server: Server,
}

impl TestEnv {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let server = store
            .create_server(&CreateServer {
                name: "edge-1".into(),
                token: TOKEN.into(),
                base_path: None,
            })
            .await
            .unwrap();
        Self { dir, store, server }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn media_root(&self) -> PathBuf {
        self.dir.path().join("media")
    }

    /// Write `body` to a script and return a tool that runs it with `/bin/sh`.
    pub fn tool(&self, name: &str, body: &str) -> ExternalTool {
        let path = self.dir.path().join(format!("{name}.sh"));
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        ExternalTool {
            program: "/bin/sh".into(),
            leading_args: vec![path.to_string_lossy().into_owned()],
        }
    }

    /// Configuration with healthy fake tools and short timings.
    pub fn config(&self) -> AgentConfig {
        AgentConfig {
            database_url: "postgres://unused".into(),
            server_token: TOKEN.into(),
            base_path: Some(self.media_root()),
            relay_bin: self.tool("relay", LONG_RUNNING),
            capture_bin: self.tool("capture", CAPTURE_WRITING),
            probe_bin: self.tool("probe", &format!("cat <<'JSON'\n{PROBE_JSON}\nJSON")),
            remux_bin: self.tool("remux", REMUX_COPY),
            heartbeat_interval: Duration::from_millis(100),
            command_poll_interval: Duration::from_millis(50),
            stats_interval: Duration::from_millis(50),
            launch_grace: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            rewrap_timeout: Duration::from_secs(5),
            ..AgentConfig::default()
        }
    }

    pub async fn agent(&self, config: AgentConfig) -> Agent {
        Agent::connect(config, self.store()).await.unwrap()
    }

    pub async fn channel(&self, name: &str, multicast: &str) -> Channel {
        self.store
            .create_channel(&CreateChannel {
                server_id: self.server.id,
                name: name.into(),
                folder_name: srtcast_core::naming::folder_name(name),
                srt_input: "srt://192.0.2.10:4000?mode=caller&latency=200".into(),
                multicast_output: multicast.into(),
            })
            .await
            .unwrap()
    }

    pub async fn get_channel(&self, id: EntityId) -> Channel {
        self.store.get_channel(id).await.unwrap().unwrap()
    }

    pub async fn get_recording(&self, id: EntityId) -> Recording {
        self.store.get_recording(id).await.unwrap().unwrap()
    }

    pub async fn command(
        &self,
        channel_id: Option<EntityId>,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Command {
        self.store
            .insert_command(&CreateCommand {
                server_id: self.server.id,
                channel_id,
                command_type: command_type.into(),
                payload,
            })
            .await
            .unwrap()
    }

    /// Wait until the command reaches `completed` or `failed`.
    pub async fn finished(&self, id: EntityId) -> Command {
        let store = self.store.clone();
        wait_until("command to finish", || {
            let store = store.clone();
            async move {
                store
                    .get_command(id)
                    .await
                    .unwrap()
                    .is_some_and(|c| c.status.is_terminal())
            }
        })
        .await;
        self.store.get_command(id).await.unwrap().unwrap()
    }
}

/// Poll `check` every 20ms for up to ten seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Whether a process with `pid` exists.
pub fn pid_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only checks for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}
