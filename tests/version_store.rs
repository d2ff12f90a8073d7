use std::sync::Arc;

use check_scheduler::db::types::version;
use check_scheduler::db::{Database, ResourceConfig, ResourceConfigFactory, Space, Version};
use serde_json::json;
use tempfile::TempDir;

fn create_config(temp_dir: &TempDir) -> ResourceConfig {
    let db = Database::open(&temp_dir.path().join("test.db")).unwrap();
    ResourceConfigFactory::new(Arc::new(db))
        .find_or_create_resource_config("some-type", &json!({"uri": "some-uri"}), &[])
        .unwrap()
}

fn commit(config: &ResourceConfig, space: &Space, versions: &[&Version]) {
    for v in versions {
        config.save_partial_version(space, v, &vec![]).unwrap();
    }
    config.finish_saving_versions().unwrap();
}

fn order_of(config: &ResourceConfig, space: &Space, v: &Version) -> i64 {
    config.find_version(space, v).unwrap().unwrap().check_order
}

#[test]
fn latest_versions_follow_recency_of_reported_versions() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_config(&temp_dir);
    let space = Space::from("space");
    let v1 = version([("ref", "v1")]);
    let v2 = version([("ref", "v2")]);
    let v3 = version([("ref", "v3")]);
    config.save_space(&space).unwrap();

    commit(&config, &space, &[&v1, &v3]);
    config.save_space_latest_version(&space, &v3).unwrap();

    let latest = config.latest_versions().unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].version, v3);
    assert_eq!(latest[0].check_order, 2);
    assert_eq!(order_of(&config, &space, &v1), 1);

    commit(&config, &space, &[&v2, &v3]);
    config.save_space_latest_version(&space, &v3).unwrap();

    let latest = config.latest_versions().unwrap();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].version, v3);
    assert_eq!(latest[0].check_order, 4);
    assert_eq!(order_of(&config, &space, &v2), 3);
    assert_eq!(config.versions(&space).unwrap().len(), 3);
}

#[test]
fn check_orders_stay_unique_and_increasing_across_batches() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_config(&temp_dir);
    let space = Space::from("space");
    config.save_space(&space).unwrap();

    let refs = ["a", "b", "c", "d"];
    let versions: Vec<Version> = refs.iter().map(|r| version([("ref", *r)])).collect();
    let batches: [&[usize]; 4] = [&[0, 1], &[2], &[1, 3, 0], &[3]];

    let mut highest = 0;
    for batch in batches {
        let reported: Vec<&Version> = batch.iter().map(|i| &versions[*i]).collect();
        commit(&config, &space, &reported);

        let orders: Vec<i64> = reported
            .iter()
            .map(|v| order_of(&config, &space, v))
            .collect();
        for order in &orders {
            assert!(*order > highest);
            highest = *order;
        }
    }

    let mut all: Vec<i64> = config
        .versions(&space)
        .unwrap()
        .into_iter()
        .map(|v| v.check_order)
        .collect();
    let count = all.len();
    all.dedup();
    assert_eq!(all.len(), count);
    assert_eq!(count, refs.len());
}

#[test]
fn spaces_are_ordered_independently() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_config(&temp_dir);
    let main = Space::from("main");
    let dev = Space::from("dev");
    config.save_space(&main).unwrap();
    config.save_space(&dev).unwrap();
    let v1 = version([("ref", "v1")]);

    commit(&config, &main, &[&v1, &version([("ref", "v2")])]);
    commit(&config, &dev, &[&v1]);

    assert_eq!(order_of(&config, &main, &v1), 1);
    assert_eq!(order_of(&config, &dev, &v1), 1);
}

#[test]
fn saving_into_an_unregistered_space_never_creates_it() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_config(&temp_dir);
    let space = Space::from("unknown");

    assert!(
        config
            .save_partial_version(&space, &version([("ref", "v1")]), &vec![])
            .is_err()
    );
    assert!(
        config
            .save_unchecked_version(&space, &version([("ref", "v1")]), &vec![])
            .is_err()
    );
    config.finish_saving_versions().unwrap();

    assert!(config.versions(&space).unwrap().is_empty());
    assert!(config.save_default_space(&space).is_err());
}

#[test]
fn find_version_misses_are_not_errors() {
    let temp_dir = TempDir::new().unwrap();
    let config = create_config(&temp_dir);
    let space = Space::from("space");
    let other = Space::from("other");
    config.save_space(&space).unwrap();
    config.save_space(&other).unwrap();
    commit(&config, &other, &[&version([("ref", "v1")])]);

    assert_eq!(
        config
            .find_version(&space, &version([("ref", "never-saved")]))
            .unwrap(),
        None
    );
    assert_eq!(
        config.find_version(&space, &version([("ref", "v1")])).unwrap(),
        None
    );
}

#[test]
fn versions_are_shared_by_configs_with_the_same_identity() {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&temp_dir.path().join("test.db")).unwrap());
    let factory = ResourceConfigFactory::new(Arc::clone(&db));
    let source = json!({"uri": "some-uri", "branch": "main"});

    let first = factory
        .find_or_create_resource_config("git", &source, &[])
        .unwrap();
    let space = Space::from("space");
    first.save_space(&space).unwrap();
    commit(&first, &space, &[&version([("ref", "v1")])]);

    let second = factory
        .find_or_create_resource_config("git", &source, &[])
        .unwrap();
    assert_eq!(first.id(), second.id());
    assert!(
        second
            .find_version(&space, &version([("ref", "v1")]))
            .unwrap()
            .is_some()
    );
}
