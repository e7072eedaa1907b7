//! Integration tests for the create-or-reuse caches.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use common::FakeCloud;
use nimbus_converge::{
    ConvergeError, CreateOrReuseCache, CreateOutcome, KeyPairCache, ProviderError, RegionalResourceKey,
    ResourceCreator, SecurityGroupCache,
};
use tokio::task::JoinSet;

fn ssh_only() -> BTreeSet<u16> {
    BTreeSet::from([22])
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gets_create_once() {
    let cloud = FakeCloud::new();
    let cache = Arc::new(SecurityGroupCache::new(Arc::clone(&cloud)));

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        tasks.spawn(async move { cache.get("us-east-1", "web", &ssh_only()).await });
    }

    let mut ids = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        ids.push(joined.unwrap().unwrap().id);
    }

    assert_eq!(ids.len(), 8);
    assert!(ids.iter().all(|id| id == &ids[0]));
    assert_eq!(cloud.group_creates.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_from_another_process_is_reused() {
    let cloud = FakeCloud::new();
    let ours = SecurityGroupCache::new(Arc::clone(&cloud));
    let theirs = SecurityGroupCache::new(Arc::clone(&cloud));

    let first = theirs.get("us-east-1", "web", &ssh_only()).await.unwrap();
    let second = ours.get("us-east-1", "web", &ssh_only()).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(cloud.group_creates.load(Ordering::SeqCst), 2);

    // Now memoized: no further remote calls.
    ours.get("us-east-1", "web", &ssh_only()).await.unwrap();
    assert_eq!(cloud.group_creates.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_creates_in_two_processes_converge() {
    let cloud = FakeCloud::new();
    let ours = SecurityGroupCache::new(Arc::clone(&cloud));
    let theirs = SecurityGroupCache::new(Arc::clone(&cloud));
    let ports = ssh_only();

    let (a, b) = tokio::join!(
        ours.get("us-east-1", "web", &ports),
        theirs.get("us-east-1", "web", &ports)
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.id, b.id);
    assert_eq!(cloud.group_creates.load(Ordering::SeqCst), 2);
    assert_eq!(cloud.group_count(), 1);
    assert_eq!(cloud.group_authorizations.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_create_is_not_cached() {
    let cloud = FakeCloud::new();
    let cache = SecurityGroupCache::new(Arc::clone(&cloud));

    cloud.fail_group_create.store(true, Ordering::SeqCst);
    let err = cache.get("us-east-1", "web", &ssh_only()).await.unwrap_err();
    assert!(matches!(err, ConvergeError::Provider(ProviderError::Unavailable(_))));

    cloud.fail_group_create.store(false, Ordering::SeqCst);
    let group = cache.get("us-east-1", "web", &ssh_only()).await.unwrap();

    assert!(cloud.has_group("us-east-1", "nimbus-web"));
    assert!(group.id.starts_with("sg-"));
    assert_eq!(cloud.group_creates.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reused_group_gains_missing_ports() {
    let cloud = FakeCloud::new();
    let cache = SecurityGroupCache::new(Arc::clone(&cloud));
    let web = BTreeSet::from([22, 80]);

    let ssh = cache.get("us-east-1", "web", &ssh_only()).await.unwrap();
    assert_eq!(ssh.inbound_ports, ssh_only());

    // Same remote name, wider rule set: the existing group is widened.
    let widened = cache.get("us-east-1", "web", &web).await.unwrap();

    assert_eq!(widened.id, ssh.id);
    assert!(widened.inbound_ports.contains(&80));
    assert_eq!(cloud.group_ports("us-east-1", "nimbus-web"), Some(web));
    assert_eq!(cloud.group_authorizations.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.group_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_invalidates_every_port_set() {
    let cloud = FakeCloud::new();
    let cache = SecurityGroupCache::new(Arc::clone(&cloud));
    let web = BTreeSet::from([22, 80]);

    let before = cache.get("us-east-1", "web", &ssh_only()).await.unwrap();
    cache.get("us-east-1", "web", &web).await.unwrap();

    assert!(cache.delete("us-east-1", "web").await.unwrap());
    assert!(!cloud.has_group("us-east-1", "nimbus-web"));

    let after = cache.get("us-east-1", "web", &web).await.unwrap();
    assert_ne!(before.id, after.id);
    assert_eq!(after.inbound_ports, web);
    assert_eq!(cloud.group_creates.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_regions_are_independent() {
    let cloud = FakeCloud::new();
    let cache = KeyPairCache::new(Arc::clone(&cloud));

    let east = cache.get("us-east-1", "web").await.unwrap();
    let west = cache.get("us-west-2", "web").await.unwrap();

    assert_eq!(east.name, "nimbus-web");
    assert_eq!(west.name, "nimbus-web");
    assert_ne!(east.fingerprint, west.fingerprint);
    assert_eq!(cloud.key_creates.load(Ordering::SeqCst), 2);
}

/// Creator whose resource vanishes between the duplicate and the lookup.
struct Vanishing;

#[async_trait]
impl ResourceCreator for Vanishing {
    type Key = RegionalResourceKey;
    type Resource = String;

    async fn create(&self, _key: &RegionalResourceKey) -> CreateOutcome<String> {
        CreateOutcome::AlreadyExists(None)
    }

    async fn describe(&self, _key: &RegionalResourceKey) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
}

#[tokio::test]
async fn test_duplicate_then_missing_is_an_error() {
    let cache = CreateOrReuseCache::new(Arc::new(Vanishing));
    let key = RegionalResourceKey::new("us-east-1", "ghost");

    let err = cache.get(&key).await.unwrap_err();

    match err {
        ConvergeError::ResourceDisappeared { id, .. } => assert_eq!(id, "us-east-1/ghost"),
        other => panic!("expected ResourceDisappeared, got {:?}", other),
    }
    assert!(cache.cached(&key).is_none());
}
