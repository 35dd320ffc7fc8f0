//! Engine-level scenarios against the in-memory store, which records every
//! backing-store call in order.

use chanstore::model::{DEFAULT_GROUP, MOD_GROUP, OWNER_GROUP};
use chanstore::store::memory::MemoryChannelStore;
use chanstore::{
    ChannelDetails, ChannelGroup, ChannelStore, ChannelSynchronizer, GroupType, StoreError,
};
use std::sync::Arc;

fn details(name: &str, owner: i64) -> ChannelDetails {
    ChannelDetails {
        name: name.to_string(),
        owner,
        ..Default::default()
    }
}

fn engine() -> (Arc<MemoryChannelStore>, ChannelSynchronizer) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let store = Arc::new(MemoryChannelStore::new());
    let sync = ChannelSynchronizer::new(Arc::clone(&store) as Arc<dyn ChannelStore>);
    (store, sync)
}

#[tokio::test]
async fn mutations_only_queue_until_commit() {
    let (store, sync) = engine();
    let id = store.create_channel(&details("Test", 42)).await.unwrap();
    store.clear_calls();

    sync.add_member(id, 102);
    sync.add_ban(id, 55);
    sync.add_attribute(id, "welcome", "hi");
    assert!(sync.has_pending_changes());
    assert!(store.calls().is_empty(), "mutation intake must not touch the store");

    sync.commit_changes().await;
    assert!(!sync.has_pending_changes());
    assert_eq!(store.count_op("insert_member"), 1);
    assert_eq!(store.count_op("insert_ban"), 1);
    assert_eq!(store.count_op("insert_attribute"), 1);
}

#[tokio::test]
async fn commit_is_a_noop_with_nothing_pending() {
    let (store, sync) = engine();
    sync.commit_changes().await;
    sync.commit_changes().await;
    // Only the end-of-cycle flush reaches the store.
    assert_eq!(store.call_ops(), vec!["flush", "flush"]);
}

#[tokio::test]
async fn phases_run_in_fixed_order() {
    let (store, sync) = engine();
    let id = store.create_channel(&details("Ordered", 1)).await.unwrap();
    store.insert_member(id, 201, DEFAULT_GROUP).await.unwrap();
    store.insert_member(id, 202, DEFAULT_GROUP).await.unwrap();
    store.insert_ban(id, 301).await.unwrap();
    store.seed_group(ChannelGroup {
        channel: id,
        group: MOD_GROUP,
        name: "Mods".into(),
        permissions: vec![0, 1, 2],
        group_type: GroupType::Moderator,
        icon_url: None,
        overrides: None,
    });
    store.insert_attribute(id, "color", "blue").await.unwrap();
    store.insert_attribute(id, "motd", "old").await.unwrap();
    store.clear_calls();

    // One pending operation in every phase, deliberately queued in a
    // scrambled order.
    sync.clear_attribute(id, "color");
    sync.remove_ban(id, 301);
    sync.update_member(id, 201, MOD_GROUP);
    sync.add_attribute(id, "welcome", "hi");
    sync.sync_details(
        id,
        ChannelDetails {
            name: "Reordered".into(),
            owner: 1,
            ..Default::default()
        },
    );
    sync.add_ban(id, 302);
    sync.update_group(
        id,
        ChannelGroup {
            channel: id,
            group: MOD_GROUP,
            name: "Moderators".into(),
            permissions: vec![0, 1, 2, 9],
            group_type: GroupType::Moderator,
            icon_url: None,
            overrides: None,
        },
    );
    sync.remove_member(id, 202);
    sync.update_attribute(id, "motd", "new");
    sync.add_member(id, 203);

    sync.commit_changes().await;

    let expected = vec![
        "insert_member",
        "update_member",
        "delete_member",
        "insert_ban",
        "delete_ban",
        "update_group",
        "update_details",
        "insert_attribute",
        "update_attribute",
        "delete_attribute",
        "flush",
    ];
    assert_eq!(store.call_ops(), expected);

    // And the writes actually landed.
    let members = store.channel_members(id).await.unwrap();
    assert_eq!(members.get(&201), Some(&MOD_GROUP));
    assert!(!members.contains_key(&202));
    assert_eq!(members.get(&203), Some(&DEFAULT_GROUP));
    let bans = store.channel_bans(id).await.unwrap();
    assert!(bans.contains(&302) && !bans.contains(&301));
    assert_eq!(store.channel_details(id).await.unwrap().name, "Reordered");
    let attrs = store.channel_attributes(id).await.unwrap();
    assert_eq!(attrs.get("welcome").map(String::as_str), Some("hi"));
    assert_eq!(attrs.get("motd").map(String::as_str), Some("new"));
    assert!(!attrs.contains_key("color"));
    assert_eq!(store.channel_groups(id).await.unwrap()[0].name, "Moderators");
}

#[tokio::test]
async fn ban_then_unban_before_commit_leaves_durable_state_alone() {
    let (store, sync) = engine();
    let id = store.create_channel(&details("Race", 1)).await.unwrap();
    store.insert_ban(id, 55).await.unwrap();
    store.clear_calls();

    sync.add_ban(id, 55);
    sync.remove_ban(id, 55);
    assert!(!sync.has_pending_changes());

    // Reads bypass the queues: the durable ban is still visible.
    assert!(sync.channel_bans(id).await.unwrap().contains(&55));

    sync.commit_changes().await;
    assert_eq!(store.count_op("insert_ban"), 0);
    assert_eq!(store.count_op("delete_ban"), 0);
    assert!(store.channel_bans(id).await.unwrap().contains(&55));
}

#[tokio::test]
async fn remove_then_add_member_commits_as_an_update() {
    let (store, sync) = engine();
    let id = store.create_channel(&details("Fold", 1)).await.unwrap();
    store.insert_member(id, 102, MOD_GROUP).await.unwrap();
    store.clear_calls();

    sync.remove_member(id, 102);
    sync.add_member(id, 102);
    sync.commit_changes().await;

    assert_eq!(store.count_op("insert_member"), 0);
    assert_eq!(store.count_op("delete_member"), 0);
    assert_eq!(store.count_op("update_member"), 1);
    assert_eq!(
        store.channel_members(id).await.unwrap().get(&102),
        Some(&DEFAULT_GROUP)
    );
}

#[tokio::test]
async fn constraint_violations_skip_the_item_but_not_the_phase() {
    let (store, sync) = engine();
    let id = store.create_channel(&details("Partial", 42)).await.unwrap();
    store.clear_calls();

    // The owner already has a member row, so this addition collides.
    sync.add_member(id, 42);
    sync.add_member(id, 102);
    sync.commit_changes().await;

    // Both additions were attempted; only the clean one landed.
    assert_eq!(store.count_op("insert_member"), 2);
    let members = store.channel_members(id).await.unwrap();
    assert_eq!(members.get(&102), Some(&DEFAULT_GROUP));
    assert_eq!(members.get(&42), Some(&OWNER_GROUP));
}

#[tokio::test]
async fn connection_failure_aborts_the_phase_and_drops_the_items() {
    let (store, sync) = engine();
    let id = store.create_channel(&details("Outage", 1)).await.unwrap();
    store.clear_calls();

    sync.add_ban(id, 1);
    sync.add_ban(id, 2);
    sync.add_ban(id, 3);

    store.set_fail_connections(true);
    sync.commit_changes().await;
    store.set_fail_connections(false);

    // The first failing attempt aborted the remaining items of the phase.
    assert_eq!(store.count_op("insert_ban"), 1);
    // Queues were drained up front: there is nothing to retry.
    assert!(!sync.has_pending_changes());
    store.clear_calls();
    sync.commit_changes().await;
    assert_eq!(store.count_op("insert_ban"), 0);
    assert!(store.channel_bans(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn later_phases_still_run_after_an_aborted_one() {
    let (store, sync) = engine();
    let id = store.create_channel(&details("Isolated", 1)).await.unwrap();
    store.clear_calls();

    sync.add_member(id, 102);
    sync.add_member(id, 103);
    sync.add_ban(id, 55);
    sync.add_attribute(id, "welcome", "hi");

    // Only the member addition phase loses its connection.
    store.fail_op("insert_member");
    sync.commit_changes().await;
    store.clear_failing_ops();

    // The first failing attempt aborted that phase's remaining item...
    assert_eq!(store.count_op("insert_member"), 1);
    let members = store.channel_members(id).await.unwrap();
    assert!(!members.contains_key(&102) && !members.contains_key(&103));
    // ...but the ban and attribute phases still ran.
    assert!(store.channel_bans(id).await.unwrap().contains(&55));
    assert_eq!(
        store.channel_attributes(id).await.unwrap().get("welcome").map(String::as_str),
        Some("hi")
    );
    // The dropped member additions are permanently lost.
    assert!(!sync.has_pending_changes());
    store.clear_calls();
    sync.commit_changes().await;
    assert_eq!(store.count_op("insert_member"), 0);
}

#[tokio::test]
async fn group_add_and_remove_are_explicitly_unsupported() {
    let (_store, sync) = engine();
    let group = ChannelGroup {
        channel: 1,
        group: 3,
        name: "New".into(),
        permissions: vec![],
        group_type: GroupType::Normal,
        icon_url: None,
        overrides: None,
    };
    assert!(matches!(
        sync.add_group(1, &group).await,
        Err(StoreError::Unsupported("add_group"))
    ));
    assert!(matches!(
        sync.remove_group(1, 3).await,
        Err(StoreError::Unsupported("remove_group"))
    ));
}

#[tokio::test]
async fn create_and_remove_channel_round_trip() {
    let (_store, sync) = engine();

    let id = sync.create_channel(&details("Test", 42)).await.unwrap();
    let members = sync.channel_members(id).await.unwrap();
    assert_eq!(members.get(&42), Some(&OWNER_GROUP));

    sync.remove_channel(id).await.unwrap();
    assert!(matches!(
        sync.channel_details(id).await,
        Err(StoreError::ChannelNotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_commits_serialize_cleanly() {
    let (store, sync) = engine();
    let sync = Arc::new(sync);
    let id = store.create_channel(&details("Busy", 1)).await.unwrap();
    store.clear_calls();

    for user in 0..50 {
        sync.add_member(id, 1000 + user);
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let sync = Arc::clone(&sync);
        handles.push(tokio::spawn(async move {
            sync.commit_changes().await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // Every addition was committed exactly once, whichever cycle won the
    // snapshot.
    assert_eq!(store.count_op("insert_member"), 50);
    assert_eq!(store.channel_members(id).await.unwrap().len(), 51);
}
