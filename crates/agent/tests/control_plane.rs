//! Operator-side rules enforced by the control plane.

mod common;

use assert_matches::assert_matches;
use serde_json::json;
use srtcast_agent::control::{ChannelEdit, ControlPlane, NewChannel};
use srtcast_agent::AgentError;
use srtcast_core::error::CoreError;
use srtcast_db::models::channel::ChannelTransition;
use srtcast_db::models::recording::CreateRecording;
use srtcast_db::models::status::{ChannelStatus, CommandStatus};
use srtcast_db::{Store, StoreError};

use common::TestEnv;

fn new_channel(env: &TestEnv, name: &str, multicast: Option<&str>) -> NewChannel {
    NewChannel {
        server_id: env.server.id,
        name: name.into(),
        srt_input: "srt://192.0.2.10:4000?latency=200&mode=caller".into(),
        multicast_output: multicast.map(str::to_string),
    }
}

async fn force_running(env: &TestEnv, channel_id: srtcast_core::types::EntityId) {
    env.store
        .transition_channel(
            channel_id,
            &ChannelTransition {
                from: vec![ChannelStatus::Stopped],
                to: ChannelStatus::Running,
                pid: Some(4_100_000),
                error_message: None,
                clear_stats: false,
            },
        )
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn created_server_gets_a_fresh_token() {
    let env = TestEnv::new().await;
    let control = ControlPlane::new(env.store());

    let a = control.create_server("edge-a", None).await.unwrap();
    let b = control.create_server("edge-b", Some("/srv/media")).await.unwrap();
    assert_ne!(a.token, b.token);
    assert_eq!(b.base_path, "/srv/media");
    assert_eq!(
        env.store.find_server_by_token(&a.token).await.unwrap().unwrap().id,
        a.id
    );

    assert_matches!(
        control.create_server("  ", None).await,
        Err(AgentError::Core(CoreError::Validation(_)))
    );
    assert_matches!(
        control.create_server("edge-c", Some("relative/path")).await,
        Err(AgentError::Core(CoreError::Validation(_)))
    );
}

#[tokio::test]
async fn channel_defaults_are_derived() {
    let env = TestEnv::new().await;
    let control = ControlPlane::new(env.store());

    let first = control
        .create_channel(new_channel(&env, "Sports Feed #1", None))
        .await
        .unwrap();
    assert_eq!(first.folder_name, "sports-feed-1");
    assert_eq!(first.status, ChannelStatus::Stopped);
    assert_eq!(first.multicast_output, srtcast_core::multicast::suggest_next(0));

    let second = control
        .create_channel(new_channel(&env, "News", None))
        .await
        .unwrap();
    assert_eq!(second.multicast_output, srtcast_core::multicast::suggest_next(1));
    assert_ne!(first.multicast_output, second.multicast_output);

    let explicit = control
        .create_channel(new_channel(&env, "Manual", Some("239.5.5.5:6000")))
        .await
        .unwrap();
    assert_eq!(explicit.multicast_output, "239.5.5.5:6000");
}

#[tokio::test]
async fn invalid_channel_configuration_is_rejected() {
    let env = TestEnv::new().await;
    let control = ControlPlane::new(env.store());

    let mut bad_srt = new_channel(&env, "Bad SRT", None);
    bad_srt.srt_input = "udp://192.0.2.10:4000".into();
    assert_matches!(control.create_channel(bad_srt).await, Err(AgentError::Core(_)));

    let unicast = new_channel(&env, "Unicast", Some("192.0.2.1:5000"));
    assert_matches!(control.create_channel(unicast).await, Err(AgentError::Core(_)));

    let mut orphan = new_channel(&env, "Orphan", None);
    orphan.server_id = uuid::Uuid::now_v7();
    assert_matches!(
        control.create_channel(orphan).await,
        Err(AgentError::NotFound { entity: "Server", .. })
    );

    assert!(env.store.list_channels(env.server.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn channel_edits_require_a_stopped_channel() {
    let env = TestEnv::new().await;
    let control = ControlPlane::new(env.store());
    let channel = control
        .create_channel(new_channel(&env, "Editable", None))
        .await
        .unwrap();

    let renamed = control
        .update_channel(
            channel.id,
            ChannelEdit {
                name: Some("Evening News".into()),
                ..ChannelEdit::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(renamed.name, "Evening News");
    assert_eq!(renamed.folder_name, "evening-news");
    assert_eq!(renamed.multicast_output, channel.multicast_output);

    force_running(&env, channel.id).await;
    let err = control
        .update_channel(
            channel.id,
            ChannelEdit {
                multicast_output: Some("239.9.9.9:5000".into()),
                ..ChannelEdit::default()
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, AgentError::Store(StoreError::Conflict(_)));
    assert_eq!(
        env.get_channel(channel.id).await.multicast_output,
        channel.multicast_output
    );
}

#[tokio::test]
async fn live_channels_and_recordings_block_deletion() {
    let env = TestEnv::new().await;
    let control = ControlPlane::new(env.store());
    let live = control
        .create_channel(new_channel(&env, "Live", None))
        .await
        .unwrap();
    force_running(&env, live.id).await;

    assert_matches!(
        control.delete_channel(live.id).await,
        Err(AgentError::Core(CoreError::Conflict(_)))
    );
    assert_matches!(
        control.delete_server(env.server.id).await,
        Err(AgentError::Core(CoreError::Conflict(_)))
    );

    let recorded = control
        .create_channel(new_channel(&env, "Recorded", None))
        .await
        .unwrap();
    env.store
        .create_recording(&CreateRecording {
            channel_id: recorded.id,
            filename: "clip.ts".into(),
            filepath: "/tmp/clip.ts".into(),
        })
        .await
        .unwrap();
    assert_matches!(
        control.delete_channel(recorded.id).await,
        Err(AgentError::Store(StoreError::Conflict(_)))
    );

    let idle = control
        .create_channel(new_channel(&env, "Idle", None))
        .await
        .unwrap();
    control.delete_channel(idle.id).await.unwrap();
    assert!(env.store.get_channel(idle.id).await.unwrap().is_none());
}

#[tokio::test]
async fn server_with_stopped_channels_can_be_deleted() {
    let env = TestEnv::new().await;
    let control = ControlPlane::new(env.store());
    control
        .create_channel(new_channel(&env, "Parked", None))
        .await
        .unwrap();

    control.delete_server(env.server.id).await.unwrap();
    assert!(env.store.get_server(env.server.id).await.unwrap().is_none());
    assert_matches!(
        control.delete_server(env.server.id).await,
        Err(AgentError::NotFound { entity: "Server", .. })
    );
}

#[tokio::test]
async fn enqueued_commands_are_validated_and_canonical() {
    let env = TestEnv::new().await;
    let control = ControlPlane::new(env.store());
    let channel = control
        .create_channel(new_channel(&env, "Queue", None))
        .await
        .unwrap();

    let cmd = control
        .enqueue_command(
            env.server.id,
            Some(channel.id),
            "start_recording",
            &json!({ "filename": "evening" }),
        )
        .await
        .unwrap();
    assert_eq!(cmd.status, CommandStatus::Pending);
    assert_eq!(cmd.payload, json!({ "filename": "evening.ts" }));

    assert_matches!(
        control
            .enqueue_command(env.server.id, Some(channel.id), "format_disk", &json!({}))
            .await,
        Err(AgentError::UnsupportedCommand(_))
    );
    assert_matches!(
        control
            .enqueue_command(env.server.id, None, "start_channel", &json!({}))
            .await,
        Err(AgentError::InvalidPayload(_))
    );
    assert_matches!(
        control
            .enqueue_command(uuid::Uuid::now_v7(), Some(channel.id), "stop_channel", &json!({}))
            .await,
        Err(AgentError::NotFound { entity: "Channel", .. })
    );

    let listed = control.list_commands(env.server.id, 10).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, cmd.id);
}
