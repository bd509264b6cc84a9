use std::{sync::Arc, time::Duration};

use notifwd::{
    buffer::BufferRegistry,
    config::ForwarderConfig,
    namespace::{AccessController, AccessError, Action, AllowAll, Namespace, NamespaceError, local::LocalNamespace},
    notification::{Handback, NotificationFilter},
    server::{ForwardingSession, SessionError},
    types::{ObjectId, Principal},
};

struct Fixture {
    ns: Arc<LocalNamespace>,
    registry: Arc<BufferRegistry>,
}

impl Fixture {
    fn new(members: &[&str]) -> Self {
        let ns = Arc::new(LocalNamespace::new("root"));
        for id in members {
            ns.register(*id, true).expect("register");
        }
        Self {
            ns,
            registry: BufferRegistry::new(),
        }
    }

    fn session(&self, access: Arc<dyn AccessController>, config: &ForwarderConfig) -> ForwardingSession {
        let namespace: Arc<dyn Namespace> = self.ns.clone();
        ForwardingSession::new(&self.registry, namespace, access, config).expect("session")
    }

    fn open(&self) -> ForwardingSession {
        self.session(Arc::new(AllowAll), &ForwarderConfig::default())
    }

    fn publish(&self, source: &str, kind: &str) {
        self.ns.publish(&ObjectId::new(source), kind, kind).expect("publish");
    }
}

#[tokio::test]
async fn events_reach_every_registration_on_their_origin() {
    let fx = Fixture::new(&["a", "b"]);
    let session = fx.open();
    let a = ObjectId::new("a");
    let first = session.register_listener(&a, None, None, None).expect("register");
    let alarms_only: NotificationFilter = Arc::new(|n| n.kind == "alarm");
    let second = session
        .register_listener(&a, Some(alarms_only), None, None)
        .expect("register");
    let on_b = session
        .register_listener(&ObjectId::new("b"), None, None, None)
        .expect("register");
    assert!(first < second && second < on_b);

    let start = session.buffer().buffer().next_seq();
    fx.publish("a", "tick");
    fx.publish("a", "alarm");
    fx.publish("b", "tick");

    let res = session.fetch(start, Duration::ZERO, 10, None).await.expect("fetch");
    let got: Vec<_> = res
        .events
        .iter()
        .map(|e| (e.listener_id, e.notification.kind.as_str()))
        .collect();
    assert_eq!(
        got,
        vec![(first, "tick"), (first, "alarm"), (second, "alarm"), (on_b, "tick")]
    );
    assert_eq!(res.next_seq, start + 3);
}

#[tokio::test]
async fn registration_requires_an_emitting_member() {
    let fx = Fixture::new(&[]);
    fx.ns.register("quiet", false).expect("register");
    let session = fx.open();

    let quiet = ObjectId::new("quiet");
    assert_eq!(
        session.register_listener(&quiet, None, None, None),
        Err(SessionError::NotAnEmitter(quiet))
    );
    let ghost = ObjectId::new("ghost");
    assert_eq!(
        session.register_listener(&ghost, None, None, None),
        Err(SessionError::Namespace(NamespaceError::NotFound(ghost)))
    );
}

fn guarded(secret: &'static str) -> Arc<dyn AccessController> {
    Arc::new(move |principal: Option<&Principal>, id: &ObjectId, action: Action| -> Result<(), AccessError> {
        let admin = principal.is_some_and(|p| p.name == "admin");
        if id.as_str() == secret && !admin && action != Action::AddListener {
            return Err(AccessError::Denied { id: id.clone(), action });
        }
        Ok(())
    })
}

#[tokio::test]
async fn fetch_permission_is_checked_per_registration() {
    let fx = Fixture::new(&["public", "secret"]);
    let session = fx.session(guarded("secret"), &ForwarderConfig::default());
    let guest = Principal::new("guest");
    let admin = Principal::new("admin");

    let open_id = session
        .register_listener(&ObjectId::new("public"), None, None, Some(guest.clone()))
        .expect("register");
    let guest_secret = session
        .register_listener(&ObjectId::new("secret"), None, None, Some(guest.clone()))
        .expect("register");
    let admin_secret = session
        .register_listener(&ObjectId::new("secret"), None, None, Some(admin.clone()))
        .expect("register");

    let start = session.buffer().buffer().next_seq();
    fx.publish("secret", "classified");
    fx.publish("public", "news");

    let res = session.fetch(start, Duration::ZERO, 10, None).await.expect("fetch");
    let ids: Vec<_> = res.events.iter().map(|e| e.listener_id).collect();
    assert_eq!(ids, vec![admin_secret, open_id]);
    assert!(!ids.contains(&guest_secret));

    // An explicit fetch principal overrides the registration's.
    let res = session
        .fetch(start, Duration::ZERO, 10, Some(&guest))
        .await
        .expect("fetch");
    let ids: Vec<_> = res.events.iter().map(|e| e.listener_id).collect();
    assert_eq!(ids, vec![open_id]);

    assert!(matches!(
        session.remove_listener(&ObjectId::new("secret"), guest_secret, Some(&guest)),
        Err(SessionError::Access(AccessError::Denied { .. }))
    ));
    session
        .remove_listener(&ObjectId::new("secret"), guest_secret, Some(&admin))
        .expect("remove");
}

#[tokio::test]
async fn member_removal_purges_its_registrations() {
    let fx = Fixture::new(&["doomed", "kept"]);
    let session = fx.open();
    let doomed = ObjectId::new("doomed");
    session.register_listener(&doomed, None, None, None).expect("register");
    session.register_listener(&doomed, None, None, None).expect("register");
    let kept = session
        .register_listener(&ObjectId::new("kept"), None, None, None)
        .expect("register");
    let tracking = session.register_removal_tracking(None).expect("tracking");
    assert_eq!(session.registration_count(), 4);

    let start = session.buffer().buffer().next_seq();
    fx.ns.unregister(&doomed).expect("unregister");
    fx.publish("kept", "tick");

    let res = session.fetch(start, Duration::ZERO, 10, None).await.expect("fetch");
    let got: Vec<_> = res.events.iter().map(|e| e.listener_id).collect();
    assert_eq!(got, vec![tracking, kept]);
    assert_eq!(res.events[0].notification.removed_member(), Some(&doomed));
    assert_eq!(session.listener_ids(), vec![kept, tracking]);
}

#[tokio::test]
async fn removal_by_id_and_exact_match() {
    let fx = Fixture::new(&["a", "b"]);
    let session = fx.open();
    let a = ObjectId::new("a");
    let token: Handback = Arc::new("token");
    let id = session
        .register_listener(&a, None, Some(Arc::clone(&token)), None)
        .expect("register");

    assert_eq!(
        session.remove_listener(&ObjectId::new("b"), id, None),
        Err(SessionError::ListenerNotFound {
            target: ObjectId::new("b"),
            id
        })
    );
    let other: Handback = Arc::new("token");
    assert!(matches!(
        session.remove_listener_exact(&a, id, None, Some(&other), None),
        Err(SessionError::ListenerNotFound { .. })
    ));
    session
        .remove_listener_exact(&a, id, None, Some(&token), None)
        .expect("exact removal");
    assert_eq!(session.registration_count(), 0);
}

#[tokio::test]
async fn fetch_limits_are_clamped_to_configuration() {
    let fx = Fixture::new(&["a"]);
    let config = ForwarderConfig {
        max_fetch_count: 2,
        fetch_timeout_ms: 50,
        ..ForwarderConfig::default()
    };
    let session = fx.session(Arc::new(AllowAll), &config);
    session.register_listener(&ObjectId::new("a"), None, None, None).expect("register");

    let start = session.buffer().buffer().next_seq();
    for _ in 0..5 {
        fx.publish("a", "tick");
    }
    let res = session.fetch(start, Duration::ZERO, 100, None).await.expect("fetch");
    assert_eq!(res.events.len(), 2);

    let idle = session
        .fetch(start + 5, Duration::from_secs(3600), 100, None)
        .await
        .expect("fetch");
    assert!(idle.events.is_empty());
}

#[tokio::test]
async fn blocked_fetch_returns_when_a_matching_event_arrives() {
    let fx = Fixture::new(&["a"]);
    let session = Arc::new(fx.open());
    let id = session.register_listener(&ObjectId::new("a"), None, None, None).expect("register");
    let start = session.buffer().buffer().next_seq();

    let fetcher = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.fetch(start, Duration::from_secs(30), 10, None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    fx.publish("a", "tick");

    let res = tokio::time::timeout(Duration::from_secs(2), fetcher)
        .await
        .expect("woke")
        .expect("join")
        .expect("fetch");
    assert_eq!(res.events.len(), 1);
    assert_eq!(res.events[0].listener_id, id);
}

#[tokio::test]
async fn terminate_releases_the_buffer_and_fails_later_calls() {
    let fx = Fixture::new(&["a"]);
    let session = fx.open();
    let other = fx.open();
    assert_eq!(fx.registry.buffer_count(), 1);
    session.register_listener(&ObjectId::new("a"), None, None, None).expect("register");

    session.terminate();
    session.terminate();
    assert!(session.is_terminated());
    assert_eq!(session.registration_count(), 0);
    assert_eq!(
        session.register_listener(&ObjectId::new("a"), None, None, None),
        Err(SessionError::Terminated)
    );
    assert!(matches!(
        session.fetch(0, Duration::ZERO, 1, None).await,
        Err(SessionError::Terminated)
    ));
    assert_eq!(fx.registry.buffer_count(), 1);

    drop(other);
    assert_eq!(fx.registry.buffer_count(), 0);
}

#[tokio::test]
async fn terminate_ends_a_blocked_fetch_while_the_buffer_stays_shared() {
    let fx = Fixture::new(&["a"]);
    let session = Arc::new(fx.open());
    let other = fx.open();
    session.register_listener(&ObjectId::new("a"), None, None, None).expect("register");
    let start = session.buffer().buffer().next_seq();

    let fetcher = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.fetch(start, Duration::from_secs(30), 10, None).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.terminate();

    let res = tokio::time::timeout(Duration::from_secs(2), fetcher)
        .await
        .expect("woke")
        .expect("join");
    assert_eq!(res.map(|r| r.events.len()), Err(SessionError::Terminated));
    assert_eq!(fx.registry.buffer_count(), 1);
    assert!(!other.buffer().buffer().is_disposed());
}
