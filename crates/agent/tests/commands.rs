//! Command dispatch, probing, the watchdog and startup recovery.

mod common;

use std::time::Duration;

use serde_json::json;
use srtcast_agent::dispatcher::InFlight;
use srtcast_agent::feed::QueueFeed;
use srtcast_agent::{watchdog, AgentError};
use srtcast_core::ts_info::TsInfo;
use srtcast_db::models::channel::ChannelTransition;
use srtcast_db::models::command::CreateCommand;
use srtcast_db::models::recording::CreateRecording;
use srtcast_db::models::server::CreateServer;
use srtcast_db::models::status::{ChannelStatus, CommandStatus, RecordingStatus};
use srtcast_db::Store;

use common::TestEnv;

#[tokio::test]
async fn unknown_token_is_rejected() {
    let env = TestEnv::new().await;
    let mut config = env.config();
    config.server_token = "tok_nobody".into();
    let result = srtcast_agent::Agent::connect(config, env.store()).await;
    assert!(matches!(result, Err(AgentError::Unauthorized)));
}

#[tokio::test]
async fn unsupported_command_fails_without_side_effects() {
    let env = TestEnv::new().await;
    let channel = env.channel("Untouched", "239.3.0.1:5000").await;
    let (tx, feed) = QueueFeed::channel();
    let running = env.agent(env.config()).await.start(feed);

    let cmd = env.command(Some(channel.id), "reboot_server", json!({})).await;
    tx.send(cmd.clone()).unwrap();
    let cmd = env.finished(cmd.id).await;

    assert_eq!(cmd.status, CommandStatus::Failed);
    assert_eq!(
        cmd.error_message.as_deref(),
        Some("Unsupported command type: reboot_server")
    );
    assert!(cmd.processed_at.is_some());
    let after = env.get_channel(channel.id).await;
    assert_eq!(after.status, ChannelStatus::Stopped);
    assert_eq!(after.updated_at, channel.updated_at);

    running.shutdown().await;
}

#[tokio::test]
async fn invalid_payload_is_reported() {
    let env = TestEnv::new().await;
    let channel = env.channel("Picky", "239.3.0.2:5000").await;
    let (tx, feed) = QueueFeed::channel();
    let running = env.agent(env.config()).await.start(feed);

    let cmd = env
        .command(Some(channel.id), "start_recording", json!({ "filename": "../escape" }))
        .await;
    tx.send(cmd.clone()).unwrap();
    let cmd = env.finished(cmd.id).await;
    assert_eq!(cmd.status, CommandStatus::Failed);
    assert!(cmd.error_message.unwrap().contains("start_recording"));

    running.shutdown().await;
}

#[tokio::test]
async fn commands_for_one_channel_run_in_order() {
    let env = TestEnv::new().await;
    let channel = env.channel("Ordered", "239.3.0.3:5000").await;
    let (tx, feed) = QueueFeed::channel();
    let running = env.agent(env.config()).await.start(feed);

    let start = env.command(Some(channel.id), "start_channel", json!({})).await;
    let stop = env.command(Some(channel.id), "stop_channel", json!({})).await;
    tx.send(start.clone()).unwrap();
    tx.send(stop.clone()).unwrap();

    let start = env.finished(start.id).await;
    let stop = env.finished(stop.id).await;
    assert_eq!(start.status, CommandStatus::Completed);
    assert_eq!(stop.status, CommandStatus::Completed);
    assert!(start.processed_at <= stop.processed_at);
    assert_eq!(stop.result.unwrap()["status"], "stopped");
    assert_eq!(env.get_channel(channel.id).await.status, ChannelStatus::Stopped);

    running.shutdown().await;
}

#[tokio::test]
async fn channel_of_another_server_is_not_found() {
    let env = TestEnv::new().await;
    let other = env
        .store
        .create_server(&CreateServer {
            name: "edge-2".into(),
            token: "tok_other_server_0001".into(),
            base_path: None,
        })
        .await
        .unwrap();
    let foreign = env
        .store
        .create_channel(&srtcast_db::models::channel::CreateChannel {
            server_id: other.id,
            name: "Foreign".into(),
            folder_name: "foreign".into(),
            srt_input: "srt://192.0.2.20:4000".into(),
            multicast_output: "239.3.0.4:5000".into(),
        })
        .await
        .unwrap();

    let (tx, feed) = QueueFeed::channel();
    let running = env.agent(env.config()).await.start(feed);
    let cmd = env.command(Some(foreign.id), "start_channel", json!({})).await;
    tx.send(cmd.clone()).unwrap();

    let cmd = env.finished(cmd.id).await;
    assert_eq!(cmd.status, CommandStatus::Failed);
    assert!(cmd.error_message.unwrap().contains("not found"));
    assert_eq!(env.get_channel(foreign.id).await.status, ChannelStatus::Stopped);

    running.shutdown().await;
}

#[tokio::test]
async fn probe_stores_stream_information() {
    let env = TestEnv::new().await;
    let channel = env.channel("Probe Me", "239.3.0.5:5000").await;
    let (tx, feed) = QueueFeed::channel();
    let running = env.agent(env.config()).await.start(feed);

    let cmd = env.command(Some(channel.id), "probe_stream", json!({})).await;
    tx.send(cmd.clone()).unwrap();
    let cmd = env.finished(cmd.id).await;
    assert_eq!(cmd.status, CommandStatus::Completed, "{:?}", cmd.error_message);

    let info: TsInfo = serde_json::from_value(cmd.result.unwrap()).unwrap();
    assert_eq!(info.service_name.as_deref(), Some("Sports 1"));
    assert_eq!(info.pcr_pid, Some(256));
    assert_eq!(info.total_bitrate, Some(6300));
    assert_eq!(info.video.len(), 1);
    assert_eq!(info.video[0].pid, 256);
    assert_eq!(info.video[0].codec, "h264");
    assert_eq!(info.video[0].resolution.as_deref(), Some("1920x1080"));
    assert_eq!(info.audio.len(), 1);
    assert_eq!(info.audio[0].pid, 257);
    assert_eq!(info.audio[0].codec, "aac");
    assert_eq!(info.audio[0].language.as_deref(), Some("eng"));

    let channel = env.get_channel(channel.id).await;
    assert!(channel.ts_info.is_some());
    assert!(channel.ts_analyzed_at.is_some());
    // Probing never changes the relay state.
    assert_eq!(channel.status, ChannelStatus::Stopped);

    running.shutdown().await;
}

#[tokio::test]
async fn failed_probe_leaves_the_channel_alone() {
    let env = TestEnv::new().await;
    let mut config = env.config();
    config.probe_bin = env.tool("probe-fail", "echo 'Connection timed out' >&2\nexit 1");
    let channel = env.channel("Unreachable", "239.3.0.6:5000").await;
    let (tx, feed) = QueueFeed::channel();
    let running = env.agent(config).await.start(feed);

    let cmd = env.command(Some(channel.id), "probe_stream", json!({})).await;
    tx.send(cmd.clone()).unwrap();
    let cmd = env.finished(cmd.id).await;
    assert_eq!(cmd.status, CommandStatus::Failed);
    assert!(cmd.error_message.unwrap().contains("Connection timed out"));

    let channel = env.get_channel(channel.id).await;
    assert_eq!(channel.status, ChannelStatus::Stopped);
    assert!(channel.ts_info.is_none());

    running.shutdown().await;
}

#[tokio::test]
async fn probe_timeout_is_reported() {
    let env = TestEnv::new().await;
    let mut config = env.config();
    config.probe_bin = env.tool("probe-hang", "exec sleep 30");
    config.probe_timeout = Duration::from_millis(300);
    let channel = env.channel("Silent", "239.3.0.7:5000").await;
    let (tx, feed) = QueueFeed::channel();
    let running = env.agent(config).await.start(feed);

    let cmd = env.command(Some(channel.id), "probe_stream", json!({})).await;
    tx.send(cmd.clone()).unwrap();
    let cmd = env.finished(cmd.id).await;
    assert_eq!(cmd.status, CommandStatus::Failed);
    assert!(cmd.error_message.unwrap().contains("within"));

    running.shutdown().await;
}

#[tokio::test]
async fn two_agents_claim_a_command_exactly_once() {
    let env = TestEnv::new().await;
    let channel = env.channel("Contested", "239.3.0.8:5000").await;

    let (tx_a, feed_a) = QueueFeed::channel();
    let (tx_b, feed_b) = QueueFeed::channel();
    let a = env.agent(env.config()).await.start(feed_a);
    let b = env.agent(env.config()).await.start(feed_b);

    let cmd = env.command(Some(channel.id), "start_channel", json!({})).await;
    tx_a.send(cmd.clone()).unwrap();
    tx_b.send(cmd.clone()).unwrap();
    let cmd = env.finished(cmd.id).await;
    assert_eq!(cmd.status, CommandStatus::Completed);

    let owners = [&a, &b]
        .iter()
        .filter(|agent| agent.supervisor().relay_pid(channel.id).is_some())
        .count();
    assert_eq!(owners, 1);

    a.shutdown().await;
    b.shutdown().await;
    assert_eq!(env.get_channel(channel.id).await.status, ChannelStatus::Stopped);
}

#[tokio::test]
async fn watchdog_fails_orphaned_commands_but_spares_in_flight_ones() {
    let env = TestEnv::new().await;
    let mut config = env.config();
    config.command_watchdog = Duration::ZERO;
    let agent = env.agent(config).await;

    let orphan = env.command(None, "probe_stream", json!({})).await;
    let busy = env.command(None, "probe_stream", json!({})).await;
    let pending = env.command(None, "probe_stream", json!({})).await;
    env.store.claim_command(orphan.id).await.unwrap().unwrap();
    env.store.claim_command(busy.id).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let in_flight = InFlight::default();
    in_flight.insert(busy.id);
    watchdog::sweep(agent.context(), &in_flight).await;

    let orphan = env.store.get_command(orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, CommandStatus::Failed);
    assert!(orphan.error_message.unwrap().contains("orphaned"));
    let busy = env.store.get_command(busy.id).await.unwrap().unwrap();
    assert_eq!(busy.status, CommandStatus::Processing);
    let pending = env.store.get_command(pending.id).await.unwrap().unwrap();
    assert_eq!(pending.status, CommandStatus::Pending);
}

#[tokio::test]
async fn recovery_cleans_up_after_a_crashed_agent() {
    let env = TestEnv::new().await;
    let was_running = env.channel("Was Running", "239.3.1.1:5000").await;
    let was_stopping = env.channel("Was Stopping", "239.3.1.2:5000").await;
    let stale_pid = Some(4_000_000);
    for (channel, to) in [
        (&was_running, ChannelStatus::Running),
        (&was_stopping, ChannelStatus::Stopping),
    ] {
        env.store
            .transition_channel(
                channel.id,
                &ChannelTransition {
                    from: vec![ChannelStatus::Stopped],
                    to,
                    pid: stale_pid,
                    error_message: None,
                    clear_stats: false,
                },
            )
            .await
            .unwrap()
            .unwrap();
    }

    let folder = env.media_root().join("was-running");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("left.ts"), b"0123456789").unwrap();
    let recording = env
        .store
        .create_recording(&CreateRecording {
            channel_id: was_running.id,
            filename: "left.ts".into(),
            filepath: folder.join("left.ts").to_string_lossy().into_owned(),
        })
        .await
        .unwrap();

    let stuck = env
        .store
        .insert_command(&CreateCommand {
            server_id: env.server.id,
            channel_id: Some(was_running.id),
            command_type: "start_recording".into(),
            payload: json!({ "filename": "left" }),
        })
        .await
        .unwrap();
    env.store.claim_command(stuck.id).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut config = env.config();
    config.resume_channels = true;
    let agent = env.agent(config).await;
    let report = agent.recover().await.unwrap();
    assert_eq!(report.failed_commands, 1);
    assert_eq!(report.closed_recordings, 1);
    assert_eq!(report.resumed_channels, 1);
    assert_eq!(report.stopped_channels, 1);

    let stuck = env.store.get_command(stuck.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, CommandStatus::Failed);
    let recording = env.get_recording(recording.id).await;
    assert_eq!(recording.status, RecordingStatus::Stopped);
    assert_eq!(recording.file_size_bytes, Some(10));

    let resumed = env.get_channel(was_running.id).await;
    assert_eq!(resumed.status, ChannelStatus::Running);
    assert_ne!(resumed.pid, stale_pid);
    assert_eq!(env.get_channel(was_stopping.id).await.status, ChannelStatus::Stopped);

    let (_tx, feed) = QueueFeed::channel();
    agent.start(feed).shutdown().await;
    assert_eq!(env.get_channel(was_running.id).await.status, ChannelStatus::Stopped);
}

#[tokio::test]
async fn recovery_without_resume_stops_live_channels() {
    let env = TestEnv::new().await;
    let channel = env.channel("Parked", "239.3.1.3:5000").await;
    env.store
        .transition_channel(
            channel.id,
            &ChannelTransition {
                from: vec![ChannelStatus::Stopped],
                to: ChannelStatus::Running,
                pid: Some(4_000_001),
                error_message: None,
                clear_stats: false,
            },
        )
        .await
        .unwrap()
        .unwrap();

    let mut config = env.config();
    config.resume_channels = false;
    let agent = env.agent(config).await;
    let report = agent.recover().await.unwrap();
    assert_eq!(report.resumed_channels, 0);
    assert_eq!(report.stopped_channels, 1);

    let parked = env.get_channel(channel.id).await;
    assert_eq!(parked.status, ChannelStatus::Stopped);
    assert_eq!(parked.pid, None);
    assert!(agent.supervisor().running_relays().is_empty());
}
