//! Recording capture and TS to MP4 rewrap, driven through commands.

mod common;

use assert_matches::assert_matches;
use serde_json::json;
use srtcast_agent::feed::QueueFeed;
use srtcast_agent::recorder::Recorder;
use srtcast_agent::{AgentConfig, AgentError, RunningAgent};
use srtcast_core::types::EntityId;
use srtcast_db::models::channel::Channel;
use srtcast_db::models::command::Command;
use srtcast_db::models::status::{ChannelStatus, CommandStatus, RecordingStatus};
use srtcast_db::Store;
use tokio::sync::mpsc::UnboundedSender;

use common::{wait_until, TestEnv};

const PAYLOAD_LEN: i64 = "TS-PAYLOAD-BYTES".len() as i64;

struct Session {
    env: TestEnv,
    running: RunningAgent,
    tx: UnboundedSender<Command>,
}

impl Session {
    async fn new() -> Self {
        Self::with_env(TestEnv::new().await, None).await
    }

    async fn with_env(env: TestEnv, remux: Option<&str>) -> Self {
        let mut config = env.config();
        if let Some(body) = remux {
            config.remux_bin = env.tool("remux-custom", body);
        }
        Self::with_config(env, config).await
    }

    async fn with_config(env: TestEnv, config: AgentConfig) -> Self {
        let agent = env.agent(config).await;
        let (tx, feed) = QueueFeed::channel();
        let running = agent.start(feed);
        Self { env, running, tx }
    }

    async fn run(
        &self,
        channel_id: Option<EntityId>,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Command {
        let command = self.env.command(channel_id, command_type, payload).await;
        self.tx.send(command.clone()).unwrap();
        self.env.finished(command.id).await
    }

    async fn running_channel(&self, name: &str, multicast: &str) -> Channel {
        let channel = self.env.channel(name, multicast).await;
        let start = self.run(Some(channel.id), "start_channel", json!({})).await;
        assert_eq!(start.status, CommandStatus::Completed, "{:?}", start.error_message);
        self.env.get_channel(channel.id).await
    }

    async fn record(&self, channel: &Channel, filename: &str) -> EntityId {
        let cmd = self
            .run(Some(channel.id), "start_recording", json!({ "filename": filename }))
            .await;
        assert_eq!(cmd.status, CommandStatus::Completed, "{:?}", cmd.error_message);
        let id = cmd.result.unwrap()["recording_id"].as_str().unwrap().parse().unwrap();

        let store = self.env.store.clone();
        wait_until("capture to write data", || {
            let store = store.clone();
            async move {
                let r = store.get_recording(id).await.unwrap().unwrap();
                std::fs::metadata(&r.filepath).is_ok_and(|m| m.len() as i64 == PAYLOAD_LEN)
            }
        })
        .await;
        id
    }

    async fn wait_for_recording(&self, id: EntityId, status: RecordingStatus) {
        let store = self.env.store.clone();
        wait_until("recording status", || {
            let store = store.clone();
            async move { store.get_recording(id).await.unwrap().unwrap().status == status }
        })
        .await;
    }
}

#[tokio::test]
async fn recording_is_captured_and_finalised() {
    let s = Session::new().await;
    let channel = s.running_channel("Match Day", "239.2.0.1:5000").await;

    let id = s.record(&channel, "final").await;
    let recording = s.env.get_recording(id).await;
    assert_eq!(recording.filename, "final.ts");
    assert_eq!(
        recording.filepath,
        s.env.media_root().join("match-day").join("final.ts").to_string_lossy()
    );
    assert_eq!(s.running.supervisor().active_captures(), vec![id]);

    let stop = s
        .run(Some(channel.id), "stop_recording", json!({ "recording_id": id }))
        .await;
    assert_eq!(stop.status, CommandStatus::Completed);
    assert_eq!(stop.result.unwrap()["file_size_bytes"], PAYLOAD_LEN);

    let recording = s.env.get_recording(id).await;
    assert_eq!(recording.status, RecordingStatus::Stopped);
    assert_eq!(recording.file_size_bytes, Some(PAYLOAD_LEN));
    assert!(recording.duration_seconds.is_some());
    assert!(recording.stopped_at.is_some());
    assert!(s.running.supervisor().active_captures().is_empty());

    s.running.shutdown().await;
}

#[tokio::test]
async fn second_recording_on_a_channel_is_rejected() {
    let s = Session::new().await;
    let channel = s.running_channel("Busy", "239.2.0.2:5000").await;
    s.record(&channel, "first").await;

    let second = s
        .run(Some(channel.id), "start_recording", json!({ "filename": "second" }))
        .await;
    assert_eq!(second.status, CommandStatus::Failed);
    assert!(second
        .error_message
        .unwrap()
        .contains("already has an active recording"));

    // Recording failures never touch the relay.
    assert_eq!(s.env.get_channel(channel.id).await.status, ChannelStatus::Running);
    s.running.shutdown().await;
}

#[tokio::test]
async fn channels_record_concurrently() {
    let s = Session::new().await;
    let a = s.running_channel("Cam A", "239.2.0.3:5000").await;
    let b = s.running_channel("Cam B", "239.2.0.4:5000").await;

    let rec_a = s.record(&a, "take").await;
    let rec_b = s.record(&b, "take").await;
    let mut active = s.running.supervisor().active_captures();
    active.sort();
    let mut expected = vec![rec_a, rec_b];
    expected.sort();
    assert_eq!(active, expected);

    s.running.shutdown().await;
    for id in [rec_a, rec_b] {
        assert_eq!(s.env.get_recording(id).await.status, RecordingStatus::Stopped);
    }
}

#[tokio::test]
async fn recording_requires_a_running_channel() {
    let s = Session::new().await;
    let channel = s.env.channel("Dark", "239.2.0.5:5000").await;

    let cmd = s
        .run(Some(channel.id), "start_recording", json!({ "filename": "nothing" }))
        .await;
    assert_eq!(cmd.status, CommandStatus::Failed);
    assert!(cmd
        .error_message
        .unwrap()
        .contains("recording requires a running channel"));
    assert_eq!(s.env.get_channel(channel.id).await.status, ChannelStatus::Stopped);
    assert!(s.env.store.list_recordings(channel.id).await.unwrap().is_empty());

    s.running.shutdown().await;
}

#[tokio::test]
async fn stopping_the_channel_finalises_its_recording() {
    let s = Session::new().await;
    let channel = s.running_channel("Short", "239.2.0.6:5000").await;
    let id = s.record(&channel, "cut-short").await;

    let stop = s.run(Some(channel.id), "stop_channel", json!({})).await;
    assert_eq!(stop.status, CommandStatus::Completed);

    let recording = s.env.get_recording(id).await;
    assert_eq!(recording.status, RecordingStatus::Stopped);
    assert_eq!(recording.file_size_bytes, Some(PAYLOAD_LEN));
    assert_eq!(s.env.get_channel(channel.id).await.status, ChannelStatus::Stopped);

    s.running.shutdown().await;
}

#[tokio::test]
async fn rewrap_produces_an_mp4_next_to_the_ts() {
    let s = Session::new().await;
    let channel = s.running_channel("Archive", "239.2.0.7:5000").await;
    let id = s.record(&channel, "show").await;
    s.run(Some(channel.id), "stop_recording", json!({ "recording_id": id }))
        .await;

    let rewrap = s
        .run(
            Some(channel.id),
            "rewrap_recording",
            json!({ "recording_id": id, "output_filename": "show-web" }),
        )
        .await;
    assert_eq!(rewrap.status, CommandStatus::Completed);
    assert_eq!(rewrap.result.unwrap()["status"], "processing");

    s.wait_for_recording(id, RecordingStatus::Completed).await;
    let recording = s.env.get_recording(id).await;
    let mp4 = s.env.media_root().join("archive").join("show-web.mp4");
    assert_eq!(recording.mp4_filepath.as_deref(), Some(&*mp4.to_string_lossy()));
    assert_eq!(std::fs::read(&mp4).unwrap(), b"TS-PAYLOAD-BYTES");

    // Already rewrapped.
    let again = s
        .run(
            Some(channel.id),
            "rewrap_recording",
            json!({ "recording_id": id, "output_filename": "show-web-2" }),
        )
        .await;
    assert_eq!(again.status, CommandStatus::Failed);

    s.running.shutdown().await;
}

#[tokio::test]
async fn failed_rewrap_marks_the_recording_errored() {
    let env = TestEnv::new().await;
    let s = Session::with_env(env, Some("echo 'moov atom not found' >&2\nexit 1")).await;
    let channel = s.running_channel("Corrupt", "239.2.0.8:5000").await;
    let id = s.record(&channel, "broken").await;
    s.run(Some(channel.id), "stop_recording", json!({ "recording_id": id }))
        .await;

    let rewrap = s
        .run(
            Some(channel.id),
            "rewrap_recording",
            json!({ "recording_id": id, "output_filename": "broken" }),
        )
        .await;
    assert_eq!(rewrap.status, CommandStatus::Completed);

    s.wait_for_recording(id, RecordingStatus::Error).await;
    let recording = s.env.get_recording(id).await;
    assert!(recording.mp4_filepath.is_none());
    assert!(recording
        .error_message
        .unwrap()
        .contains("moov atom not found"));

    s.running.shutdown().await;
}

#[tokio::test]
async fn active_recording_cannot_be_rewrapped() {
    let s = Session::new().await;
    let channel = s.running_channel("Live", "239.2.0.9:5000").await;
    let id = s.record(&channel, "ongoing").await;

    let rewrap = s
        .run(
            Some(channel.id),
            "rewrap_recording",
            json!({ "recording_id": id, "output_filename": "ongoing" }),
        )
        .await;
    assert_eq!(rewrap.status, CommandStatus::Failed);
    assert!(rewrap.error_message.unwrap().contains("still in progress"));
    assert_eq!(s.env.get_recording(id).await.status, RecordingStatus::Recording);

    s.running.shutdown().await;
}

#[tokio::test]
async fn hung_rewrap_times_out_into_error() {
    let env = TestEnv::new().await;
    let mut config = env.config();
    config.remux_bin = env.tool("remux-hang", "exec sleep 30");
    config.rewrap_timeout = std::time::Duration::from_secs(1);
    let s = Session::with_config(env, config).await;
    let channel = s.running_channel("Stuck", "239.2.1.1:5000").await;
    let id = s.record(&channel, "stuck").await;
    s.run(Some(channel.id), "stop_recording", json!({ "recording_id": id }))
        .await;

    let rewrap = s
        .run(
            Some(channel.id),
            "rewrap_recording",
            json!({ "recording_id": id, "output_filename": "stuck" }),
        )
        .await;
    assert_eq!(rewrap.status, CommandStatus::Completed);

    s.wait_for_recording(id, RecordingStatus::Error).await;
    let recording = s.env.get_recording(id).await;
    assert!(recording.mp4_filepath.is_none());
    let message = recording.error_message.unwrap();
    assert!(message.contains("timed out"), "{message}");

    s.running.shutdown().await;
}

#[tokio::test]
async fn concurrent_starts_leave_one_active_recording() {
    let env = TestEnv::new().await;
    let agent = env.agent(env.config()).await;
    let supervisor = agent.supervisor().clone();
    let recorder = Recorder::new(agent.context().clone(), supervisor.clone());
    let channel = env.channel("Contended", "239.2.1.2:5000").await;
    supervisor.start_relay(&channel).await.unwrap();

    let (a, b) = tokio::join!(
        recorder.start_recording(channel.id, "left.ts"),
        recorder.start_recording(channel.id, "right.ts"),
    );
    assert!(a.is_ok() != b.is_ok(), "exactly one start must win: {a:?} / {b:?}");
    let (winner, err) = match (a, b) {
        (Ok(r), Err(e)) | (Err(e), Ok(r)) => (r, e),
        _ => unreachable!(),
    };
    assert_matches!(err, AgentError::RecordingAlreadyActive(id) if id == channel.id);

    let recordings = env.store.list_recordings(channel.id).await.unwrap();
    let active: Vec<_> = recordings
        .iter()
        .filter(|r| r.status == RecordingStatus::Recording)
        .map(|r| r.id)
        .collect();
    assert_eq!(active, vec![winner.id]);
    assert_eq!(supervisor.active_captures(), vec![winner.id]);

    supervisor.stop_relay(channel.id).await.unwrap();
    assert_eq!(env.get_recording(winner.id).await.status, RecordingStatus::Stopped);
}
