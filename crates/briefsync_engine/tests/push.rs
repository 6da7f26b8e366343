//! Integration tests for pushing local changes and reconciling codes.

use briefsync_testkit::prelude::*;
use proptest::prelude::*;
use serde_json::json;

async fn edited(env: &TestEnv, repo: RepositoryId) -> TestBriefcase {
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(99))
        .unwrap();
    briefcase.handle_mut().save_changes().unwrap();
    briefcase
}

fn tag(value: &str) -> Code {
    Code::new("tag", "site", value)
}

fn pushed(outcome: PushOutcome) -> ChangeSet {
    match outcome {
        PushOutcome::Pushed(change_set) => change_set,
        PushOutcome::NothingToPush => panic!("expected a pushed change-set"),
    }
}

#[tokio::test]
async fn push_creates_the_next_change_set() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(3);
    let mut briefcase = edited(&env, repo).await;
    let mut rx = env.manager.subscribe();

    let change_set = pushed(
        env.manager
            .push(&mut briefcase, "tune flow", ChangeSetType::Regular, false)
            .await
            .unwrap(),
    );

    assert_eq!(change_set.index, 4);
    assert_eq!(change_set.parent_id, history[2].id);
    assert_eq!(change_set.replica_id, Some(briefcase.replica_id()));
    assert_eq!(change_set.change_type, ChangeSetType::Regular);
    assert_eq!(change_set.description, "tune flow");
    assert_eq!(env.remote().tip(repo), change_set.position());
    assert_eq!(briefcase.header().unwrap().parent_change_set_id, change_set.id);
    assert!(!briefcase.handle().has_pending_txns());
    assert!(env.manager.pending_codes(&briefcase).unwrap().is_empty());

    assert_eq!(
        rx.try_recv().unwrap(),
        SyncEvent::Pushed {
            repository: repo,
            replica: briefcase.replica_id(),
            change_set: change_set.clone(),
        }
    );

    let other = env.download(repo, &VersionRef::Latest).await;
    assert_eq!(records_of(&other), records_of(&briefcase));
}

#[tokio::test]
async fn push_merges_remote_changes_first() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(2);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase
        .handle_mut()
        .edit("e1", "Pump", "label", json!("mine"))
        .unwrap();
    briefcase.handle_mut().save_changes().unwrap();
    let remote_change = env.remote().append_ops(repo, seed_ops(3));

    let change_set = pushed(
        env.manager
            .push(&mut briefcase, "", ChangeSetType::Regular, false)
            .await
            .unwrap(),
    );

    assert_eq!(change_set.parent_id, remote_change.id);
    assert_eq!(change_set.index, 4);
    let records = records_of(&briefcase);
    assert_eq!(records["e1"]["Pump.label"], json!("mine"));
    assert_eq!(records["e0"]["Pump.flow"], json!(3));

    let other = env.download(repo, &VersionRef::Latest).await;
    assert_eq!(records_of(&other), records);
}

#[tokio::test]
async fn replicas_push_one_after_another() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut first = env.download(repo, &VersionRef::Latest).await;
    let mut second = env.download(repo, &VersionRef::Latest).await;
    first
        .handle_mut()
        .edit("e1", "Pump", "label", json!("first"))
        .unwrap();
    first.handle_mut().save_changes().unwrap();
    second
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(20))
        .unwrap();
    second.handle_mut().save_changes().unwrap();

    let a = pushed(
        env.manager
            .push(&mut first, "a", ChangeSetType::Regular, false)
            .await
            .unwrap(),
    );
    let b = pushed(
        env.manager
            .push(&mut second, "b", ChangeSetType::Regular, false)
            .await
            .unwrap(),
    );
    assert_eq!(b.parent_id, a.id);
    assert_eq!(b.index, a.index + 1);

    env.manager
        .pull_and_merge(&mut first, &VersionRef::Latest)
        .await
        .unwrap();
    assert_eq!(records_of(&first), records_of(&second));
}

#[tokio::test]
async fn nothing_to_push() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(2);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;

    let outcome = env
        .manager
        .push(&mut briefcase, "", ChangeSetType::Regular, false)
        .await
        .unwrap();

    assert_eq!(outcome, PushOutcome::NothingToPush);
    assert_eq!(env.remote().calls().create, 0);
}

#[tokio::test]
async fn push_preconditions() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);

    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(1))
        .unwrap();
    let err = env
        .manager
        .push(&mut briefcase, "", ChangeSetType::Regular, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let replica = briefcase.replica_id();
    let mut standalone = Briefcase::new(repo, ReplicaId::STANDALONE, briefcase.into_handle());
    let err = env
        .manager
        .push(&mut standalone, "", ChangeSetType::Regular, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    drop(standalone);

    let mut read_only = env.manager.open(repo, replica, OpenMode::ReadOnly).unwrap();
    let err = env
        .manager
        .push(&mut read_only, "", ChangeSetType::Regular, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(env.remote().calls().create, 0);
}

#[tokio::test]
async fn contention_is_retried() {
    for status in [
        RemoteStatus::AnotherUserPushing,
        RemoteStatus::PullIsRequired,
        RemoteStatus::DatabaseTemporarilyLocked,
        RemoteStatus::OperationFailed,
    ] {
        let env = TestEnv::new();
        let (repo, _) = env.seed_repository(1);
        let mut briefcase = edited(&env, repo).await;
        env.remote().fail_next_upload(status, false);
        env.remote().fail_next_upload(status, false);

        let change_set = pushed(
            env.manager
                .push(&mut briefcase, "", ChangeSetType::Regular, false)
                .await
                .unwrap(),
        );

        assert_eq!(env.remote().calls().create, 3, "{status}");
        assert_eq!(change_set.index, 2);
        assert_eq!(env.remote().history(repo).len(), 2);
    }
}

#[tokio::test]
async fn retries_are_bounded() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = edited(&env, repo).await;
    for _ in 0..5 {
        env.remote()
            .fail_next_upload(RemoteStatus::AnotherUserPushing, false);
    }

    let err = env
        .manager
        .push(&mut briefcase, "", ChangeSetType::Regular, false)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Contention);
    assert_eq!(env.remote().calls().create, 5);
    assert!(briefcase.handle().has_pending_txns());
    assert_eq!(briefcase.handle().state().unwrap().creating, None);
}

#[tokio::test]
async fn other_failures_are_not_retried() {
    let env = TestEnv::new();
    let (repo, history) = env.seed_repository(1);
    let mut briefcase = edited(&env, repo).await;
    env.remote().fail_next_upload(RemoteStatus::Unauthorized, false);

    let err = env
        .manager
        .push(&mut briefcase, "", ChangeSetType::Regular, false)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Remote);
    assert_eq!(err.remote_status(), Some(RemoteStatus::Unauthorized));
    assert_eq!(env.remote().calls().create, 1);
    assert_eq!(env.remote().tip(repo), history[0].position());
    assert!(briefcase.handle().has_pending_txns());
    assert_eq!(briefcase.handle().state().unwrap().creating, None);
    let leftovers = std::fs::read_dir(briefcase.path().parent().unwrap())
        .unwrap()
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .path()
                .extension()
                .is_some_and(|ext| ext == "cs")
        })
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn already_existing_change_set_goes_straight_to_reconciliation() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(5))
        .unwrap();
    briefcase.handle_mut().use_code(tag("P-100")).unwrap();
    briefcase.handle_mut().save_changes().unwrap();
    env.remote()
        .fail_next_upload(RemoteStatus::ChangeSetAlreadyExists, true);
    let mut rx = env.manager.subscribe();

    let change_set = pushed(
        env.manager
            .push(&mut briefcase, "", ChangeSetType::Regular, false)
            .await
            .unwrap(),
    );

    assert_eq!(env.remote().calls().create, 1);
    assert_eq!(env.remote().tip(repo).id, change_set.id);
    assert_eq!(briefcase.header().unwrap().parent_change_set_id, change_set.id);
    assert!(!briefcase.handle().has_pending_txns());
    assert_eq!(env.remote().calls().update_codes, 1);
    assert_eq!(
        env.remote().code_owner(repo, &tag("P-100")),
        Some(briefcase.replica_id())
    );
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn codes_are_claimed_after_push() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase
        .handle_mut()
        .edit("e9", "Pump", "label", json!("P-1"))
        .unwrap();
    briefcase.handle_mut().use_code(tag("P-1")).unwrap();
    briefcase.handle_mut().use_code(tag("P-2")).unwrap();
    briefcase.handle_mut().save_changes().unwrap();

    env.manager
        .push(&mut briefcase, "", ChangeSetType::Regular, false)
        .await
        .unwrap();

    for value in ["P-1", "P-2"] {
        assert_eq!(
            env.remote().code_owner(repo, &tag(value)),
            Some(briefcase.replica_id())
        );
    }
    assert!(env.manager.pending_codes(&briefcase).unwrap().is_empty());
    assert!(env.remote().holds_locks(repo, briefcase.replica_id()));
}

#[tokio::test]
async fn conflicting_codes_are_final() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let other = ReplicaId::new(77);
    env.remote().claim_code(repo, tag("P-1"), other);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase.handle_mut().use_code(tag("P-1")).unwrap();
    briefcase.handle_mut().use_code(tag("P-2")).unwrap();
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(0))
        .unwrap();
    briefcase.handle_mut().save_changes().unwrap();

    let outcome = env
        .manager
        .push(&mut briefcase, "", ChangeSetType::Regular, false)
        .await
        .unwrap();

    assert!(matches!(outcome, PushOutcome::Pushed(_)));
    assert!(env.manager.pending_codes(&briefcase).unwrap().is_empty());
    assert_eq!(env.remote().code_owner(repo, &tag("P-1")), Some(other));
    assert_eq!(
        env.remote().code_owner(repo, &tag("P-2")),
        Some(briefcase.replica_id())
    );
}

#[tokio::test]
async fn failed_code_update_stays_pending_until_swept() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase.handle_mut().use_code(tag("P-7")).unwrap();
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(7))
        .unwrap();
    briefcase.handle_mut().save_changes().unwrap();
    env.remote().fail_next_code_update(RemoteStatus::Network);

    let change_set = pushed(
        env.manager
            .push(&mut briefcase, "", ChangeSetType::Regular, false)
            .await
            .unwrap(),
    );

    assert_eq!(env.manager.pending_codes(&briefcase).unwrap(), vec![change_set.id.clone()]);
    assert_eq!(env.remote().code_owner(repo, &tag("P-7")), None);

    let summary = env.manager.reconcile_pending(&briefcase).await.unwrap();

    assert_eq!(
        summary,
        ReconcileSummary {
            processed: 1,
            reconciled: 1,
            conflicted: 0,
            deferred: 0,
            remaining: 0,
        }
    );
    assert_eq!(
        env.remote().code_owner(repo, &tag("P-7")),
        Some(briefcase.replica_id())
    );
    assert!(env.manager.pending_codes(&briefcase).unwrap().is_empty());
}

#[tokio::test]
async fn sweep_keeps_ids_it_cannot_fetch() {
    let env = TestEnv::with_config(|config| config.with_reconcile_batch_limit(1));
    let (repo, _) = env.seed_repository(1);
    let briefcase = env.download(repo, &VersionRef::Latest).await;
    let path = env
        .manager
        .cache()
        .pending_codes_path(repo, briefcase.replica_id());
    let mut pending = PendingCodeSet::load(&path).unwrap();
    pending.insert("gone-1").unwrap();
    pending.insert("gone-2").unwrap();

    let summary = env.manager.reconcile_pending(&briefcase).await.unwrap();

    assert_eq!(summary.processed, 1);
    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.remaining, 2);
    assert_eq!(
        env.manager.pending_codes(&briefcase).unwrap(),
        vec!["gone-1".to_string(), "gone-2".to_string()]
    );
}

#[tokio::test]
async fn relinquish_releases_codes_and_locks() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    briefcase.handle_mut().use_code(tag("P-3")).unwrap();
    briefcase
        .handle_mut()
        .edit("e0", "Pump", "flow", json!(3))
        .unwrap();
    briefcase.handle_mut().save_changes().unwrap();

    env.manager
        .push(&mut briefcase, "", ChangeSetType::Regular, true)
        .await
        .unwrap();

    assert_eq!(env.remote().code_owner(repo, &tag("P-3")), None);
    assert!(!env.remote().holds_locks(repo, briefcase.replica_id()));
    assert_eq!(env.remote().calls().delete_codes, 1);
    assert_eq!(env.remote().calls().delete_locks, 1);
}

#[tokio::test]
async fn schema_imports_push_as_schema_change_sets() {
    let env = TestEnv::new();
    let (repo, _) = env.seed_repository(1);
    let mut briefcase = env.download(repo, &VersionRef::Latest).await;
    let delta = SchemaDelta::new("Plant", 2).with_change(SchemaChange::AddProperty {
        class: "Pump".into(),
        property: "rating".into(),
        property_type: PropertyType::Double,
    });
    env.manager.import_schema(&mut briefcase, &delta).unwrap();

    let change_set = pushed(
        env.manager
            .push(&mut briefcase, "schema", ChangeSetType::Regular, false)
            .await
            .unwrap(),
    );

    assert_eq!(change_set.change_type, ChangeSetType::Schema);
    let files = env.remote().change_set_files(repo);
    assert_eq!(files.last().and_then(|f| f.schema.clone()), Some(delta));

    let other = env.download(repo, &VersionRef::Latest).await;
    assert_eq!(other.handle().schema_version("Plant"), Some(2));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn every_used_code_is_claimed(codes in prop::collection::vec(code_strategy(), 1..6)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let env = TestEnv::new();
            let (repo, _) = env.seed_repository(1);
            let mut briefcase = env.download(repo, &VersionRef::Latest).await;
            for code in &codes {
                briefcase.handle_mut().use_code(code.clone()).unwrap();
            }
            briefcase
                .handle_mut()
                .edit("e0", "Pump", "flow", json!(codes.len()))
                .unwrap();
            briefcase.handle_mut().save_changes().unwrap();

            env.manager
                .push(&mut briefcase, "", ChangeSetType::Regular, false)
                .await
                .unwrap();

            for code in &codes {
                assert_eq!(env.remote().code_owner(repo, code), Some(briefcase.replica_id()));
            }
        });
    }
}
