//! Integration tests for moving briefcases through the change-set history.

use briefsync_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::json;

fn drain(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn empty_target_id_lists_nothing() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(2);

    let found = env
        .manager
        .download_change_sets(repo, &history[0].id, "", &CancellationHandle::new())
        .await
        .unwrap();

    assert!(found.is_empty());
    assert_eq!(env.remote().calls().list, 0);
}

#[tokio::test]
async fn equal_ids_list_nothing() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(2);

    let found = env
        .manager
        .download_change_sets(repo, &history[1].id, &history[1].id, &CancellationHandle::new())
        .await
        .unwrap();

    assert!(found.is_empty());
    assert_eq!(env.remote().calls().list, 0);
    assert_eq!(env.remote().calls().download, 0);
}

#[tokio::test]
async fn downloads_the_half_open_range_once() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(4);
    let cancel = CancellationHandle::new();

    let found = env
        .manager
        .download_change_sets(repo, &history[0].id, &history[3].id, &cancel)
        .await
        .unwrap();
    let indices: Vec<u64> = found.iter().map(|cs| cs.index).collect();
    assert_eq!(indices, vec![2, 3, 4]);
    assert_eq!(env.remote().calls().files_downloaded, 3);

    let dir = env.manager.cache().change_sets_dir(repo);
    assert!(found.iter().all(|cs| dir.join(cs.file_name()).is_file()));

    env.manager
        .download_change_sets(repo, "", &history[3].id, &cancel)
        .await
        .unwrap();
    assert_eq!(env.remote().calls().files_downloaded, 4);
}

#[tokio::test]
async fn unknown_range_end_is_not_found() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(1);

    let err = env
        .manager
        .download_change_sets(repo, &history[0].id, "nope", &CancellationHandle::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn pull_merges_new_change_sets() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(2);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    let mut rx = env.manager.subscribe();
    env.remote().append_ops(repo, seed_ops(3));
    let tip = env.remote().append_ops(repo, seed_ops(4));

    let outcome = env
        .manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap();

    assert_eq!(outcome.plan, SyncPlan::Merge { to: tip.position() });
    assert_eq!(outcome.position, tip.position());
    assert!(outcome.rebase.is_none());
    assert_eq!(records_of(&briefcase), env.records_at(repo, 4));
    assert_ne!(briefcase.header().unwrap().parent_change_set_id, history[1].id);

    let events = drain(&mut rx);
    assert_eq!(
        events,
        vec![SyncEvent::Applied {
            repository: repo,
            replica: briefcase.replica_id(),
            option: ApplyOption::Merge,
            position: tip.position(),
            success: true,
        }]
    );
}

#[tokio::test]
async fn pull_keeps_pending_local_changes() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(2);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase
        .handle_mut()
        .edit("e1", "Pump", "label", json!("mine"))
        .unwrap();
    briefcase.handle_mut().save_changes().unwrap();
    env.remote().append_ops(repo, seed_ops(3));

    env.manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap();

    let handle = briefcase.handle();
    assert!(handle.has_pending_txns());
    assert_eq!(handle.value("e1", "Pump", "label"), Some(json!("mine")));
    assert_eq!(handle.value("e0", "Pump", "flow"), Some(json!(3)));
}

#[tokio::test]
async fn same_position_is_a_no_op() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(3);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    let downloads = env.remote().calls().download;
    let applies = env.engine.sync_applies();

    let outcome = env
        .manager
        .process_change_sets(&mut briefcase, &VersionRef::Latest, &CancellationHandle::new())
        .await
        .unwrap();

    assert!(outcome.plan.is_noop());
    assert_eq!(env.remote().calls().download, downloads);
    assert_eq!(env.engine.sync_applies(), applies);
}

#[tokio::test]
async fn reverse_then_reinstate_restores_records() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(5);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;

    let outcome = env
        .manager
        .reverse(&mut briefcase, &version_at(&history, 2))
        .await
        .unwrap();
    assert_eq!(outcome.position, history[1].position());
    assert_eq!(records_of(&briefcase), env.records_at(repo, 2));
    let header = briefcase.header().unwrap();
    assert_eq!(header.parent_change_set_id, history[4].id);
    assert_eq!(header.reversed_change_set_id.as_deref(), Some(history[1].id.as_str()));

    let outcome = env.manager.reinstate(&mut briefcase, None).await.unwrap();
    assert_eq!(outcome.position, history[4].position());
    assert_eq!(records_of(&briefcase), env.records_at(repo, 5));
    assert_eq!(briefcase.header().unwrap().reversed_change_set_id, None);
}

#[tokio::test]
async fn reverse_to_first_empties_the_records() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(3);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    let mut rx = env.manager.subscribe();

    env.manager
        .reverse(&mut briefcase, &VersionRef::First)
        .await
        .unwrap();

    assert!(records_of(&briefcase).is_empty());
    let position = env.manager.replica_position(&briefcase).await.unwrap();
    assert!(position.current().is_initial());
    assert_eq!(position.parent(), &history[2].position());
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [SyncEvent::Applied { option: ApplyOption::Reverse, success: true, position, .. }]
            if position.is_initial()
    ));
}

#[tokio::test]
async fn reverse_refuses_to_move_forward() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(3);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    env.manager
        .reverse(&mut briefcase, &version_at(&history, 1))
        .await
        .unwrap();

    let err = env
        .manager
        .reverse(&mut briefcase, &version_at(&history, 2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn reinstate_requires_reversed_state() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(2);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;

    let err = env.manager.reinstate(&mut briefcase, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn reinstate_rejects_targets_outside_the_reversed_range() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(4);
    let mut briefcase = env.download(repo, &version_at(&history, 3)).await;
    env.manager
        .reverse(&mut briefcase, &version_at(&history, 2))
        .await
        .unwrap();

    let err = env
        .manager
        .reinstate(&mut briefcase, Some(&version_at(&history, 1)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let err = env
        .manager
        .reinstate(&mut briefcase, Some(&VersionRef::Latest))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn pull_while_reversed_reinstates_then_merges() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(3);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    env.manager
        .reverse(&mut briefcase, &version_at(&history, 1))
        .await
        .unwrap();
    env.remote().append_ops(repo, seed_ops(4));
    let tip = env.remote().append_ops(repo, seed_ops(5));

    let outcome = env
        .manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap();

    assert_eq!(
        outcome.plan,
        SyncPlan::ReinstateThenMerge {
            reinstate_to: history[2].position(),
            merge_to: tip.position(),
        }
    );
    assert_eq!(records_of(&briefcase), env.records_at(repo, 5));
    assert_eq!(briefcase.header().unwrap().reversed_change_set_id, None);
}

#[tokio::test]
async fn navigation_with_pending_transactions_is_refused() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(3);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(7))
        .unwrap();
    briefcase.handle_mut().save_changes().unwrap();

    let err = env
        .manager
        .reverse(&mut briefcase, &version_at(&history, 1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(briefcase.handle().value("e0", "Pump", "flow"), Some(json!(7)));
}

#[tokio::test]
async fn unsaved_changes_block_processing() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    env.remote().append_ops(repo, seed_ops(2));
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(9))
        .unwrap();

    let err = env
        .manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    briefcase.handle_mut().abandon_changes().unwrap();
    env.manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap();
    assert_eq!(records_of(&briefcase), env.records_at(repo, 2));
}

#[tokio::test]
async fn read_only_briefcases_cannot_move() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let replica = env.download(repo, &VersionRef::Latest).await.replica_id();
    env.remote().append_ops(repo, seed_ops(2));
    let mut briefcase = env.manager.open(repo, replica, OpenMode::ReadOnly).unwrap();

    let err = env
        .manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn failed_apply_stops_at_the_last_good_change_set() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(2);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    let third = env.remote().append_ops(repo, seed_ops(3));
    let fourth = env.remote().append_ops(repo, seed_ops(4));
    env.engine.fail_apply_of(fourth.id.clone());

    let err = env
        .manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ApplyError);
    assert!(matches!(err, SyncError::Apply { status: Some(STATUS_INJECTED), .. }));
    let position = env.manager.replica_position(&briefcase).await.unwrap();
    assert_eq!(position.current(), &third.position());
    assert_ne!(position.current(), &history[1].position());
}

#[tokio::test]
async fn large_batches_apply_off_task() {
    let env = TestEnv::with_config(|config| config.with_async_apply_threshold(0));
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    env.remote().append_ops(repo, seed_ops(2));
    let tip = env.remote().append_ops(repo, seed_ops(3));
    let sync_before = env.engine.sync_applies();
    let batch_before = env.engine.batch_applies();
    let mut rx = env.manager.subscribe();

    env.manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap();

    assert_eq!(env.engine.sync_applies(), sync_before);
    assert_eq!(env.engine.batch_applies(), batch_before + 1);
    assert!(briefcase.handle().is_open());
    assert_eq!(briefcase.handle().open_mode(), OpenMode::ReadWrite);
    assert_eq!(records_of(&briefcase), env.records_at(repo, 3));
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [SyncEvent::Applied { success: true, position, .. }] if *position == tip.position()
    ));
}

#[tokio::test]
async fn reopen_failure_after_async_apply() {
    let env = TestEnv::with_config(|config| config.with_async_apply_threshold(0));
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    env.remote().append_ops(repo, seed_ops(2));
    env.engine.fail_next_reopen();
    let mut rx = env.manager.subscribe();

    let err = env
        .manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ApplyError);
    assert!(!briefcase.handle().is_open());
    assert!(matches!(
        drain(&mut rx).as_slice(),
        [SyncEvent::Applied { success: false, .. }]
    ));

    briefcase.handle_mut().reopen(OpenMode::ReadWrite).unwrap();
    assert_eq!(records_of(&briefcase), env.records_at(repo, 2));
}

#[tokio::test]
async fn schema_change_sets_apply_off_task() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    let delta = SchemaDelta::new("Plant", 2).with_change(SchemaChange::AddClass {
        class: "Valve".into(),
    });
    let file = ChangeSetFile::new(env.remote().tip(repo).id, Vec::new(), Some(delta), Vec::new());
    env.remote().append(repo, &file, "add valve");
    let batch_before = env.engine.batch_applies();

    env.manager
        .pull_and_merge(&mut briefcase, &VersionRef::Latest)
        .await
        .unwrap();

    assert_eq!(env.engine.batch_applies(), batch_before + 1);
    assert_eq!(briefcase.handle().schema_version("Plant"), Some(2));
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn reverse_and_reinstate_track_history((len, reverse_to, reinstate_to) in navigation_strategy()) {
        runtime().block_on(async {
            let env = TestEnv::new();
            let (repo, history) = env.seed_repository(len);
            let mut briefcase = env.download(repo, &VersionRef::Latest).await;

            env.manager
                .reverse(&mut briefcase, &version_at(&history, reverse_to))
                .await
                .unwrap();
            assert_eq!(records_of(&briefcase), env.records_at(repo, reverse_to));

            if reverse_to < len {
                env.manager
                    .reinstate(&mut briefcase, Some(&version_at(&history, reinstate_to)))
                    .await
                    .unwrap();
            }
            assert_eq!(records_of(&briefcase), env.records_at(repo, reinstate_to.max(reverse_to)));

            env.manager
                .pull_and_merge(&mut briefcase, &VersionRef::Latest)
                .await
                .unwrap();
            assert_eq!(records_of(&briefcase), env.records_at(repo, len));
            assert_eq!(briefcase.header().unwrap().reversed_change_set_id, None);
        });
    }
}
