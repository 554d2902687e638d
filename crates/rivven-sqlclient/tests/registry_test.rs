//! Notification registry tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rivven_sqlclient::prelude::*;
use rivven_sqlclient::testing::RecordingDependency;

fn registry(domain: &str) -> Arc<NotificationRegistry> {
    NotificationRegistry::new(RegistryConfig::new().with_domain_key(domain))
}

fn register(registry: &NotificationRegistry, dep: &Arc<RecordingDependency>) {
    registry.add_dependency_entry(dep.clone()).unwrap();
}

// ============================================================================
// Registration
// ============================================================================

#[test]
fn test_lookup_after_invalidation() {
    let registry = registry("d1");
    let dep = Arc::new(RecordingDependency::new("dep-1"));
    register(&registry, &dep);

    let key = registry.add_command_entry("fp-1", dep.as_ref()).unwrap();
    assert!(key.starts_with("d1;"));
    assert!(registry.lookup_dependency_entry("dep-1").unwrap().is_some());

    registry
        .invalidate_by_correlation_key(&SqlNotification::change(key, NotificationInfo::Update))
        .unwrap();

    assert!(registry.lookup_dependency_entry("dep-1").unwrap().is_none());
    assert_eq!(
        dep.invalidations(),
        vec![(
            NotificationType::Change,
            NotificationInfo::Update,
            NotificationSource::Data
        )]
    );
}

#[test]
fn test_duplicate_and_empty_ids_rejected() {
    let registry = registry("d1");
    let dep = Arc::new(RecordingDependency::new("dep-1"));
    register(&registry, &dep);

    let again = Arc::new(RecordingDependency::new("dep-1"));
    assert!(matches!(
        registry.add_dependency_entry(again),
        Err(Error::DuplicateDependency { .. })
    ));
    assert!(matches!(
        registry.add_dependency_entry(Arc::new(RecordingDependency::new(""))),
        Err(Error::ArgumentNull { .. })
    ));
    assert!(matches!(
        registry.lookup_dependency_entry(""),
        Err(Error::DependencyIdMismatch { .. })
    ));
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.stats().dependencies_added, 1);
}

#[test]
fn test_command_entry_is_idempotent() {
    let registry = registry("d1");
    let dep = Arc::new(RecordingDependency::new("dep-1"));
    register(&registry, &dep);

    let first = registry.add_command_entry("fp-1", dep.as_ref()).unwrap();
    let second = registry.add_command_entry("fp-1", dep.as_ref()).unwrap();

    assert_eq!(first, second);
    assert_eq!(registry.dependencies_for_key(&first), vec!["dep-1".to_string()]);
}

#[test]
fn test_command_entry_for_unknown_dependency() {
    let registry = registry("d1");
    let dep = RecordingDependency::new("never-added");

    assert!(registry.add_command_entry("fp-1", &dep).is_none());
    assert!(registry.dependencies_for_key("d1;anything").is_empty());
}

#[test]
fn test_dependencies_share_key_per_fingerprint() {
    let registry = registry("d1");
    let a = Arc::new(RecordingDependency::new("a"));
    let b = Arc::new(RecordingDependency::new("b"));
    register(&registry, &a);
    register(&registry, &b);

    let fingerprint = CommandFingerprint::new("SELECT id FROM dbo.orders WHERE id > @id", [("@id", "0")]);
    let key_a = registry.add_command_entry(fingerprint.as_str(), a.as_ref()).unwrap();
    let key_b = registry.add_command_entry(fingerprint.as_str(), b.as_ref()).unwrap();
    let other = registry.add_command_entry("other", b.as_ref()).unwrap();

    assert_eq!(key_a, key_b);
    assert_ne!(key_a, other);

    registry
        .invalidate_by_correlation_key(&SqlNotification::change(key_a, NotificationInfo::Insert))
        .unwrap();
    assert_eq!(a.invalidations().len(), 1);
    assert_eq!(b.invalidations().len(), 1);
    assert!(registry.is_empty());
    // b is gone, so its other subscription is gone with it
    assert!(registry.dependencies_for_key(&other).is_empty());
}

// ============================================================================
// Invalidation fan-out
// ============================================================================

#[test]
fn test_unknown_key_is_ignored() {
    let registry = registry("d1");
    registry
        .invalidate_by_correlation_key(&SqlNotification::change("d1;missing", NotificationInfo::Update))
        .unwrap();
    registry
        .invalidate_by_correlation_key(&SqlNotification::new(
            NotificationInfo::Update,
            NotificationSource::Data,
            NotificationType::Change,
            None,
        ))
        .unwrap();
}

#[test]
fn test_failing_callback_does_not_stop_batch() {
    let registry = registry("d1");
    let deps: Vec<Arc<RecordingDependency>> = (0..5)
        .map(|i| {
            let dep = RecordingDependency::new(format!("dep-{}", i));
            if i == 2 {
                Arc::new(dep.failing_with(Error::notification("handler failed")))
            } else {
                Arc::new(dep)
            }
        })
        .collect();

    let mut key = None;
    for dep in &deps {
        register(&registry, dep);
        key = registry.add_command_entry("fp-shared", dep.as_ref());
    }
    let key = key.unwrap();
    assert_eq!(registry.dependencies_for_key(&key).len(), 5);

    registry
        .invalidate_by_correlation_key(&SqlNotification::change(key, NotificationInfo::Delete))
        .unwrap();

    for dep in &deps {
        assert_eq!(dep.invalidations().len(), 1);
    }
    assert!(registry.is_empty());

    let stats = registry.stats();
    assert_eq!(stats.dependencies_invalidated, 5);
    assert_eq!(stats.callback_failures, 1);
}

#[test]
fn test_fatal_callback_aborts_batch() {
    let registry = registry("d1");
    let first = Arc::new(
        RecordingDependency::new("first")
            .failing_with(Error::fatal(FatalKind::OutOfMemory, "allocation failed")),
    );
    let second = Arc::new(RecordingDependency::new("second"));
    register(&registry, &first);
    register(&registry, &second);
    let key = registry.add_command_entry("fp", first.as_ref()).unwrap();
    registry.add_command_entry("fp", second.as_ref()).unwrap();

    let result =
        registry.invalidate_by_correlation_key(&SqlNotification::change(key, NotificationInfo::Update));

    assert!(result.unwrap_err().is_fatal());
    assert_eq!(first.invalidations().len(), 1);
    assert!(second.invalidations().is_empty());
    // the whole batch was removed before any callback ran
    assert!(registry.is_empty());
}

#[test]
fn test_invalidate_by_server() {
    let registry = registry("d1");
    let a = Arc::new(RecordingDependency::new("a").on_server("db01"));
    let b = Arc::new(RecordingDependency::new("b").on_server("db02"));
    let c = Arc::new(RecordingDependency::new("c").on_server("db02").on_server("db01"));
    for dep in [&a, &b, &c] {
        register(&registry, dep);
    }

    registry
        .invalidate_by_server("db01", &SqlNotification::server_down())
        .unwrap();

    let expected = vec![(
        NotificationType::Change,
        NotificationInfo::Error,
        NotificationSource::Client,
    )];
    assert_eq!(a.invalidations(), expected);
    assert_eq!(c.invalidations(), expected);
    assert!(b.invalidations().is_empty());
    assert_eq!(registry.len(), 1);
    assert!(registry.lookup_dependency_entry("b").unwrap().is_some());
}

#[test]
fn test_sql_dependency_handlers_run_on_notification() {
    let registry = registry("d1");
    let dep = Arc::new(SqlDependency::new(registry.domain_key(), None));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    dep.on_change(move |args| {
        assert_eq!(args.info, NotificationInfo::Truncate);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    registry.add_dependency_entry(dep.clone()).unwrap();
    let fingerprint = CommandFingerprint::new(
        "SELECT id FROM dbo.orders WHERE customer = @c",
        [("@c", "42")],
    );
    let key = registry
        .add_command_entry(fingerprint.as_str(), dep.as_ref())
        .unwrap();

    registry
        .invalidate_by_correlation_key(&SqlNotification::change(key, NotificationInfo::Truncate))
        .unwrap();

    assert!(dep.has_changes());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_add_and_invalidate_stay_consistent() {
    let registry = registry("d1");
    let seed = Arc::new(RecordingDependency::new("seed"));
    register(&registry, &seed);
    let key = registry.add_command_entry("fp", seed.as_ref()).unwrap();

    let deps: Vec<Arc<RecordingDependency>> = (0..16)
        .map(|i| Arc::new(RecordingDependency::new(format!("dep-{}", i))))
        .collect();

    std::thread::scope(|s| {
        for dep in &deps {
            let registry = &registry;
            s.spawn(move || {
                registry.add_dependency_entry(dep.clone()).unwrap();
                registry.add_command_entry("fp", dep.as_ref());
            });
        }
        let registry = &registry;
        let key = key.clone();
        s.spawn(move || {
            for _ in 0..4 {
                registry
                    .invalidate_by_correlation_key(&SqlNotification::change(
                        key.clone(),
                        NotificationInfo::Update,
                    ))
                    .unwrap();
            }
        });
    });

    // every dependency was either invalidated exactly once or is still tracked
    for dep in &deps {
        let tracked = registry.lookup_dependency_entry(dep.id()).unwrap().is_some();
        let invalidated = dep.invalidations().len();
        assert!(invalidated <= 1);
        assert_ne!(tracked, invalidated == 1);
    }
}

#[test]
fn test_fingerprints_forgotten_once_subscription_empties() {
    let registry = registry("d1");
    for i in 0..100 {
        let dep = Arc::new(RecordingDependency::new(format!("dep-{}", i)));
        register(&registry, &dep);
        let key = registry
            .add_command_entry(&format!("select {}", i), dep.as_ref())
            .unwrap();
        registry
            .invalidate_by_correlation_key(&SqlNotification::change(key, NotificationInfo::Update))
            .unwrap();
    }
    assert!(registry.is_empty());
    assert_eq!(registry.command_count(), 0);

    // server loss keeps fingerprints another dependency still listens on
    let a = Arc::new(RecordingDependency::new("a").on_server("db01"));
    let b = Arc::new(RecordingDependency::new("b").on_server("db01"));
    let c = Arc::new(RecordingDependency::new("c").on_server("db02"));
    for dep in [&a, &b, &c] {
        register(&registry, dep);
    }
    registry.add_command_entry("only-a", a.as_ref()).unwrap();
    let shared = registry.add_command_entry("shared", b.as_ref()).unwrap();
    registry.add_command_entry("shared", c.as_ref()).unwrap();
    assert_eq!(registry.command_count(), 2);

    registry
        .invalidate_by_server("db01", &SqlNotification::server_down())
        .unwrap();
    assert_eq!(registry.command_count(), 1);
    assert_eq!(registry.add_command_entry("shared", c.as_ref()), Some(shared));

    // expiry
    let expired = Arc::new(
        RecordingDependency::new("expired").expiring_at(Instant::now() - Duration::from_millis(10)),
    );
    register(&registry, &expired);
    registry.add_command_entry("expiring", expired.as_ref()).unwrap();
    registry.start_timer(expired.as_ref());
    assert_eq!(registry.command_count(), 2);

    assert_eq!(registry.sweep_timeouts().unwrap(), 1);
    assert_eq!(registry.command_count(), 1);
}

#[test]
fn test_callback_can_reenter_registry_during_fan_out() {
    let registry = registry("d1");
    let late = Arc::new(
        RecordingDependency::new("late").expiring_at(Instant::now() + Duration::from_secs(60)),
    );
    let rekeyed = Arc::new(std::sync::Mutex::new(None));

    let first = {
        let registry = Arc::downgrade(&registry);
        let late = late.clone();
        let rekeyed = rekeyed.clone();
        Arc::new(RecordingDependency::new("first").with_hook(move || {
            let Some(registry) = registry.upgrade() else { return };
            // already gone by the time its callback runs
            assert!(registry.lookup_dependency_entry("first").unwrap().is_none());

            registry.add_dependency_entry(late.clone()).unwrap();
            let key = registry.add_command_entry("fp", late.as_ref());
            registry.start_timer(late.as_ref());
            *rekeyed.lock().unwrap() = key;
        }))
    };
    let second = Arc::new(RecordingDependency::new("second"));
    register(&registry, &first);
    register(&registry, &second);
    let key = registry.add_command_entry("fp", first.as_ref()).unwrap();
    registry.add_command_entry("fp", second.as_ref()).unwrap();

    registry
        .invalidate_by_correlation_key(&SqlNotification::change(key.clone(), NotificationInfo::Update))
        .unwrap();

    assert_eq!(first.invalidations().len(), 1);
    assert_eq!(second.invalidations().len(), 1);
    assert!(late.invalidations().is_empty());

    let rekeyed = rekeyed.lock().unwrap().clone().unwrap();
    assert_ne!(rekeyed, key);
    assert_eq!(registry.dependencies_for_key(&rekeyed), vec!["late".to_string()]);
    assert!(registry.dependencies_for_key(&key).is_empty());
    assert_eq!(registry.len(), 1);
    assert!(registry.is_timer_enabled());
    assert_eq!(registry.next_timeout(), late.expiration_time());
}

// ============================================================================
// Timeouts
// ============================================================================

#[test]
fn test_sweep_expires_only_past_deadlines() {
    let registry = registry("d1");
    let now = Instant::now();
    let expired_a =
        Arc::new(RecordingDependency::new("expired-a").expiring_at(now - Duration::from_secs(1)));
    let expired_b =
        Arc::new(RecordingDependency::new("expired-b").expiring_at(now - Duration::from_millis(5)));
    let alive =
        Arc::new(RecordingDependency::new("alive").expiring_at(now + Duration::from_secs(60)));

    for dep in [&expired_a, &expired_b, &alive] {
        register(&registry, dep);
        registry.start_timer(dep.as_ref());
    }
    assert_eq!(registry.next_timeout(), expired_a.expiration_time());

    assert_eq!(registry.sweep_timeouts().unwrap(), 2);
    assert_eq!(
        expired_a.invalidations(),
        vec![(
            NotificationType::Change,
            NotificationInfo::Error,
            NotificationSource::Timeout
        )]
    );
    assert_eq!(expired_b.invalidations().len(), 1);
    assert!(alive.invalidations().is_empty());
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.next_timeout(), alive.expiration_time());
    assert_eq!(registry.stats().dependencies_timed_out, 2);

    // horizon is in the future: nothing to do
    assert_eq!(registry.sweep_timeouts().unwrap(), 0);
    assert!(alive.invalidations().is_empty());
}

#[test]
fn test_sweep_with_no_expiring_dependencies() {
    let registry = registry("d1");
    let forever = Arc::new(RecordingDependency::new("forever"));
    register(&registry, &forever);
    registry.start_timer(forever.as_ref());

    assert_eq!(registry.next_timeout(), None);
    assert_eq!(registry.sweep_timeouts().unwrap(), 0);
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_sweep_removes_expired_even_when_callback_is_fatal() {
    let registry = registry("d1");
    let past = Instant::now() - Duration::from_secs(1);
    let dep = Arc::new(
        RecordingDependency::new("expired")
            .expiring_at(past)
            .failing_with(Error::fatal(FatalKind::Aborted, "aborted")),
    );
    register(&registry, &dep);
    registry.start_timer(dep.as_ref());

    assert!(registry.sweep_timeouts().unwrap_err().is_fatal());
    assert!(registry.is_empty());
    assert!(!registry.is_timer_enabled());
}

#[test]
fn test_deadline_added_during_sweep_is_not_lost() {
    let registry = registry("d1");
    let now = Instant::now();
    let early = Arc::new(RecordingDependency::new("early").expiring_at(now + Duration::from_secs(5)));
    let alive = Arc::new(RecordingDependency::new("alive").expiring_at(now + Duration::from_secs(60)));

    let expired = {
        let registry = Arc::downgrade(&registry);
        let early = early.clone();
        Arc::new(
            RecordingDependency::new("expired")
                .expiring_at(now - Duration::from_secs(1))
                .with_hook(move || {
                    let Some(registry) = registry.upgrade() else { return };
                    registry.add_dependency_entry(early.clone()).unwrap();
                    registry.add_command_entry("fp-early", early.as_ref()).unwrap();
                    registry.start_timer(early.as_ref());
                }),
        )
    };
    for dep in [&expired, &alive] {
        register(&registry, dep);
        registry.start_timer(dep.as_ref());
    }

    assert_eq!(registry.sweep_timeouts().unwrap(), 1);
    assert!(registry.lookup_dependency_entry("early").unwrap().is_some());
    assert!(registry.lookup_dependency_entry("expired").unwrap().is_none());
    // never later than the deadline registered mid-sweep
    let horizon = registry.next_timeout().unwrap();
    assert!(horizon <= early.expiration_time().unwrap());

    // the next pass scans everything and settles on the earliest survivor
    assert_eq!(registry.sweep_timeouts().unwrap(), 0);
    assert_eq!(registry.next_timeout(), early.expiration_time());
    assert_eq!(registry.len(), 2);
    assert_eq!(registry.command_count(), 1);
}

#[tokio::test]
async fn test_background_sweep_expires_dependency() {
    let registry = NotificationRegistry::new(
        RegistryConfig::new()
            .with_domain_key("timer")
            .with_sweep_interval(Duration::from_millis(20)),
    );
    let dep = Arc::new(
        RecordingDependency::new("short-lived")
            .expiring_at(Instant::now() + Duration::from_millis(10)),
    );
    register(&registry, &dep);
    registry.start_timer(dep.as_ref());
    assert!(registry.is_timer_enabled());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !registry.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(registry.is_empty());
    assert_eq!(dep.invalidations().len(), 1);
    assert!(!registry.is_timer_enabled());
}

#[tokio::test]
async fn test_shutdown_disables_timer() {
    let registry = registry("d1");
    let dep = Arc::new(
        RecordingDependency::new("a").expiring_at(Instant::now() + Duration::from_secs(60)),
    );
    register(&registry, &dep);
    registry.start_timer(dep.as_ref());

    registry.shutdown();
    registry.shutdown();
    assert!(!registry.is_timer_enabled());

    let later = Arc::new(
        RecordingDependency::new("b").expiring_at(Instant::now() + Duration::from_secs(5)),
    );
    register(&registry, &later);
    registry.start_timer(later.as_ref());
    assert!(!registry.is_timer_enabled());
}

// ============================================================================
// Dispatcher
// ============================================================================

#[test]
fn test_dispatcher_routes_by_domain_key() {
    let dispatcher = Arc::new(LocalProcessDispatcher::new());
    let r1 = NotificationRegistry::with_dispatcher(
        RegistryConfig::new().with_domain_key("a"),
        dispatcher.clone(),
    );
    let r2 = NotificationRegistry::with_dispatcher(
        RegistryConfig::new().with_domain_key("b"),
        dispatcher.clone(),
    );
    dispatcher.register(&r1);
    dispatcher.register(&r2);

    let in_a = Arc::new(RecordingDependency::new("in-a"));
    let in_b = Arc::new(RecordingDependency::new("in-b"));
    register(&r1, &in_a);
    register(&r2, &in_b);
    let key_a = r1.add_command_entry("fp", in_a.as_ref()).unwrap();
    r2.add_command_entry("fp", in_b.as_ref()).unwrap();

    dispatcher
        .dispatch(&SqlNotification::change(key_a, NotificationInfo::Insert))
        .unwrap();
    assert_eq!(in_a.invalidations().len(), 1);
    assert!(in_b.invalidations().is_empty());

    dispatcher
        .dispatch(&SqlNotification::change("c;unknown", NotificationInfo::Insert))
        .unwrap();
    dispatcher
        .dispatch(&SqlNotification::change("no-domain", NotificationInfo::Insert))
        .unwrap();
}

#[test]
fn test_dispatcher_server_down_reaches_every_registry() {
    let dispatcher = Arc::new(LocalProcessDispatcher::new());
    let r1 = registry("a");
    let r2 = registry("b");
    dispatcher.register(&r1);
    dispatcher.register(&r2);

    let a = Arc::new(RecordingDependency::new("a").on_server("db01"));
    let b = Arc::new(RecordingDependency::new("b").on_server("db01"));
    register(&r1, &a);
    register(&r2, &b);

    dispatcher.server_down("db01").unwrap();
    assert_eq!(a.invalidations().len(), 1);
    assert_eq!(b.invalidations().len(), 1);
    assert!(r1.is_empty() && r2.is_empty());
}

#[test]
fn test_registry_teardown_unregisters_domain() {
    let dispatcher = Arc::new(LocalProcessDispatcher::new());
    let r1 = NotificationRegistry::with_dispatcher(
        RegistryConfig::new().with_domain_key("a"),
        dispatcher.clone(),
    );
    let r2 = NotificationRegistry::with_dispatcher(
        RegistryConfig::new().with_domain_key("b"),
        dispatcher.clone(),
    );
    dispatcher.register(&r1);
    dispatcher.register(&r2);
    assert_eq!(dispatcher.len(), 2);

    r1.shutdown();
    assert_eq!(dispatcher.len(), 1);

    drop(r2);
    assert!(dispatcher.is_empty());
}
