//! The cross-server scenarios: registration, directory collisions,
//! migration handoff, location replication, and proximity result streams,
//! all running over the in-memory network with the real link transport.

use parsec_shared::{
    LocField, LocFieldValue, ObjectId, ServerId, ServerMessage, SessionStatus, TimedMotionVector,
    Vec3,
};
use parsec_space::{LocFieldKind, SessionEvent, SubscriberRef};
use parsec_test::{object_datagram, TestSpace};

fn oid(value: u128) -> ObjectId {
    ObjectId::from_u128(value)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn fresh_registration_resolves_everywhere() {
    init_logging();
    let mut space = TestSpace::new(2);
    let object = oid(0x01);

    let status = space.connect_object(ServerId(1), object, Vec3::ZERO, 1.0);
    assert_eq!(status, SessionStatus::Success);

    // server 2 has no answer yet; the lookup goes async
    let now = space.now();
    assert!(space.server(ServerId(2)).oseg_mut().lookup(&object, now).is_none());
    space.run(5);

    let now = space.now();
    let entry = space
        .server(ServerId(2))
        .oseg_mut()
        .lookup(&object, now)
        .expect("directory entry after one round trip");
    assert_eq!(entry.server, ServerId(1));
    assert_eq!(entry.radius, 1.0);
    // and the answer is cached
    assert!(space.server(ServerId(2)).oseg_mut().cache_lookup(&object).is_some());
}

#[test]
fn simultaneous_registration_has_exactly_one_winner() {
    init_logging();
    let mut space = TestSpace::new(2);
    let object = oid(0x02);

    // both servers see the session request before either directory write
    // resolves
    let request = TestSpace::session_request(object, Vec3::ZERO, 1.0);
    let encoded = ServerMessage::SessionRequest(request).encode();
    let now = space.now();
    space
        .server(ServerId(1))
        .handle_object_datagram(object_datagram(object, parsec_shared::port::SESSION, encoded.clone()), now);
    space
        .server(ServerId(2))
        .handle_object_datagram(object_datagram(object, parsec_shared::port::SESSION, encoded), now);
    space.run(10);

    let mut statuses: Vec<SessionStatus> = space
        .session_events
        .iter()
        .filter_map(|(_, event)| match event {
            SessionEvent::Admitted { .. } => Some(SessionStatus::Success),
            SessionEvent::Rejected { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    statuses.sort_by_key(|status| format!("{:?}", status));
    assert_eq!(
        statuses,
        vec![SessionStatus::AlreadyRegistered, SessionStatus::Success]
    );
}

#[test]
fn migration_round_trip_hands_authority_over() {
    init_logging();
    let mut space = TestSpace::new(3);
    let object = oid(0x03);

    assert_eq!(
        space.connect_object(ServerId(1), object, Vec3::new(5.0, 0.0, 0.0), 1.0),
        SessionStatus::Success
    );
    space.run(3);

    let now = space.now();
    assert!(space.server(ServerId(1)).begin_migration(&object, ServerId(2), now));
    log::info!("migration of {} started", object);

    // destination takes authority once the directory write and the ack
    // round-trip complete
    let arrived = space.run_until(200, |space| {
        space.server(ServerId(2)).loc().is_local(&object)
            && !space.server(ServerId(1)).loc().is_local(&object)
    });
    assert!(arrived, "migration never completed");

    assert!(space.session_events.iter().any(|(server, event)| {
        *server == ServerId(2) && matches!(event, SessionEvent::MigrationArrived { .. })
    }));
    assert!(space.session_events.iter().any(|(server, event)| {
        *server == ServerId(1) && matches!(event, SessionEvent::MigrationCompleted { .. })
    }));

    // a third party resolves the new owner
    let resolved = space.run_until(50, |space| {
        let now = space.now();
        match space.server(ServerId(3)).oseg_mut().lookup(&object, now) {
            Some(entry) => entry.server == ServerId(2),
            None => false,
        }
    });
    assert!(resolved, "server 3 still resolves the old owner");
}

#[test]
fn migrated_object_keeps_its_presence_state() {
    init_logging();
    let mut space = TestSpace::new(2);
    let object = oid(0x13);

    space.connect_object(ServerId(1), object, Vec3::new(7.0, 0.0, 0.0), 2.0);
    space
        .server(ServerId(1))
        .loc_mut()
        .local_updated(
            &object,
            LocField {
                seqno: 9,
                value: LocFieldValue::Mesh("meerkat:///migrant.dae".to_string()),
            },
        );
    space.run(2);

    let now = space.now();
    space.server(ServerId(1)).begin_migration(&object, ServerId(2), now);
    let arrived = space.run_until(200, |space| space.server(ServerId(2)).loc().is_local(&object));
    assert!(arrived);

    let record = space.server(ServerId(2)).loc().record(&object).unwrap().clone();
    assert_eq!(record.mesh, "meerkat:///migrant.dae");
    assert_eq!(record.seqno(LocFieldKind::Mesh), 9);
    assert_eq!(record.location.position().x, 7.0);
}

#[test]
fn loc_update_reaches_remote_subscriber_once_with_one_field() {
    init_logging();
    let mut space = TestSpace::new(2);
    let object = oid(0x04);

    space.connect_object(ServerId(1), object, Vec3::ZERO, 1.0);
    space
        .server(ServerId(1))
        .loc_mut()
        .subscribe(SubscriberRef::Server(ServerId(2)), object);

    let t0 = space.now();
    space.server(ServerId(1)).loc_mut().local_updated(
        &object,
        LocField {
            seqno: 5,
            value: LocFieldValue::Location(TimedMotionVector::stationary(
                t0,
                Vec3::new(42.0, 0.0, 0.0),
            )),
        },
    );

    let replicated = space.run_until(50, |space| {
        space.server(ServerId(2)).loc().record(&object).is_some()
    });
    assert!(replicated, "subscriber never saw the update");

    {
        let record = space.server(ServerId(2)).loc().record(&object).unwrap();
        assert_eq!(record.location.position().x, 42.0);
        assert_eq!(record.seqno(LocFieldKind::Location), 5);
        // untouched fields arrived without state: their seqnos never moved
        assert_eq!(record.seqno(LocFieldKind::Orientation), 0);
        assert_eq!(record.seqno(LocFieldKind::Mesh), 0);
    }

    // a stale update (seq 4) leaves the replica at seq 5
    space.server(ServerId(1)).loc_mut().local_updated(
        &object,
        LocField {
            seqno: 4,
            value: LocFieldValue::Location(TimedMotionVector::stationary(
                t0,
                Vec3::new(-1.0, 0.0, 0.0),
            )),
        },
    );
    space.run(20);
    let record = space.server(ServerId(2)).loc().record(&object).unwrap();
    assert_eq!(record.location.position().x, 42.0);
    assert_eq!(record.seqno(LocFieldKind::Location), 5);
}

#[test]
fn prox_query_streams_enter_events() {
    init_logging();
    let mut space = TestSpace::new(1);
    let querier = oid(0x10);
    let near = oid(0x11);
    let far = oid(0x12);

    space.connect_object(ServerId(1), querier, Vec3::ZERO, 1.0);
    space.connect_object(ServerId(1), near, Vec3::new(10.0, 0.0, 0.0), 1.0);
    space.connect_object(ServerId(1), far, Vec3::new(1000.0, 0.0, 0.0), 1.0);
    space.server(ServerId(1)).register_object_query(querier, 0.01, 100);
    space.run(3);

    // initial result set: the near object only
    let messages = space.drain_object_messages(ServerId(1), querier);
    let mut entered = Vec::new();
    let mut exited = Vec::new();
    for (port, message) in &messages {
        if let Ok(ServerMessage::Prox(results)) = message {
            assert_eq!(*port, parsec_shared::port::PROXIMITY);
            entered.extend(results.enter.iter().map(|(object, _)| *object));
            exited.extend(results.exit.iter().copied());
        }
    }
    assert_eq!(entered, vec![near]);
    assert!(exited.is_empty());

    // the far object grows until it crosses the threshold
    space.server(ServerId(1)).loc_mut().local_updated(
        &far,
        LocField {
            seqno: 2,
            value: LocFieldValue::Bounds(parsec_shared::BoundingInfo::single_object(100.0)),
        },
    );
    space.run(3);

    let messages = space.drain_object_messages(ServerId(1), querier);
    let mut entered = Vec::new();
    let mut exited = Vec::new();
    for (_, message) in &messages {
        if let Ok(ServerMessage::Prox(results)) = message {
            entered.extend(results.enter.iter().map(|(object, _)| *object));
            exited.extend(results.exit.iter().copied());
        }
    }
    assert_eq!(entered, vec![far]);
    assert!(exited.is_empty());
}

#[test]
fn prox_enter_seeds_loc_subscription() {
    init_logging();
    let mut space = TestSpace::new(1);
    let querier = oid(0x20);
    let target = oid(0x21);

    space.connect_object(ServerId(1), querier, Vec3::ZERO, 1.0);
    space.connect_object(ServerId(1), target, Vec3::new(5.0, 0.0, 0.0), 1.0);
    space.server(ServerId(1)).register_object_query(querier, 0.0, 100);
    space.run(3);
    space.drain_object_messages(ServerId(1), querier);

    // a later update on the target flows to the querier as a loc delta
    let t0 = space.now();
    space.server(ServerId(1)).loc_mut().local_updated(
        &target,
        LocField {
            seqno: 3,
            value: LocFieldValue::Location(TimedMotionVector::stationary(
                t0,
                Vec3::new(6.0, 0.0, 0.0),
            )),
        },
    );
    space.run(3);

    let messages = space.drain_object_messages(ServerId(1), querier);
    let update = messages
        .iter()
        .find_map(|(port, message)| match message {
            Ok(ServerMessage::Loc(update)) if update.object == target => Some((*port, update.clone())),
            _ => None,
        })
        .expect("loc delta delivered to the querier");
    assert_eq!(update.0, parsec_shared::port::LOCATION);
    assert_eq!(update.1.fields.len(), 1);
    assert_eq!(update.1.fields[0].seqno, 3);
}

#[test]
fn object_messages_route_between_servers() {
    init_logging();
    let mut space = TestSpace::new(2);
    let sender = oid(0x30);
    let receiver = oid(0x31);

    space.connect_object(ServerId(1), sender, Vec3::ZERO, 1.0);
    space.connect_object(ServerId(2), receiver, Vec3::new(10.0, 0.0, 0.0), 1.0);
    space.run(2);

    space.send_object_message(ServerId(1), sender, receiver, b"hello across nodes".to_vec());
    let delivered = space.run_until(100, |space| {
        let messages = space.drain_object_messages(ServerId(2), receiver);
        messages
            .iter()
            .any(|(_, message)| matches!(message, Err(payload) if payload == b"hello across nodes"))
    });
    assert!(delivered, "object message never crossed the servers");
}

#[test]
fn everything_still_converges_on_a_lossy_network() {
    init_logging();
    let mut space = TestSpace::with_loss(2, 0.0, 99);
    let object = oid(0x40);

    space.connect_object(ServerId(1), object, Vec3::ZERO, 1.0);
    space
        .server(ServerId(1))
        .loc_mut()
        .subscribe(SubscriberRef::Server(ServerId(2)), object);
    // drop a third of all inter-server datagrams from here on
    space.set_loss(0.33);

    let t0 = space.now();
    space.server(ServerId(1)).loc_mut().local_updated(
        &object,
        LocField {
            seqno: 2,
            value: LocFieldValue::Location(TimedMotionVector::stationary(
                t0,
                Vec3::new(8.0, 8.0, 8.0),
            )),
        },
    );

    let replicated = space.run_until(600, |space| {
        space
            .server(ServerId(2))
            .loc()
            .record(&object)
            .map(|record| record.location.position().x == 8.0)
            .unwrap_or(false)
    });
    assert!(replicated, "replication did not survive loss");
}
