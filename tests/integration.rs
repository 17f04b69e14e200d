use bookswap::{
    Book, BookId, Coordinates, ExchangeEngine, ExchangeError, ExchangeId, ExchangeStatus,
    ExchangeStore, InMemoryExchangeStore, MockNotificationSink, NewExchange, PickupLocation,
    UserId, UserProfile,
};
use std::sync::Arc;
use uuid::Uuid;

type Engine = ExchangeEngine<InMemoryExchangeStore, MockNotificationSink>;

fn owner(first_name: &str) -> UserProfile {
    UserProfile {
        id: UserId(Uuid::new_v4()),
        first_name: first_name.to_string(),
        last_name: "Reader".to_string(),
        email: Some(format!("{}@example.com", first_name.to_lowercase())),
        phone: Some("+977-9800000000".to_string()),
        role: Some("user".to_string()),
    }
}

fn book(id: i64, title: &str, owner: &UserProfile) -> Book {
    Book {
        id: BookId(id),
        title: title.to_string(),
        owner: owner.clone(),
        pickup_location: PickupLocation {
            address: "Patan Durbar Square".to_string(),
            coordinates: Some(Coordinates {
                latitude: 27.6727,
                longitude: 85.3253,
            }),
        },
        eligible: true,
    }
}

async fn setup(books: &[&Book]) -> (Engine, Arc<InMemoryExchangeStore>, Arc<MockNotificationSink>) {
    let store = Arc::new(InMemoryExchangeStore::new());
    for book in books {
        store.upsert_book(book).await.expect("Failed to register book");
    }
    let sink = Arc::new(MockNotificationSink::new());
    (ExchangeEngine::new(store.clone(), sink.clone()), store, sink)
}

fn offer(offered: &Book, requested: &Book) -> NewExchange {
    NewExchange {
        initiator: offered.owner.id,
        counterparty: requested.owner.id,
        requested_book: requested.clone(),
        offered_book: offered.clone(),
    }
}

async fn status(store: &InMemoryExchangeStore, id: ExchangeId) -> Option<ExchangeStatus> {
    store
        .get_exchange(id)
        .await
        .expect("Failed to read exchange")
        .map(|exchange| exchange.status())
}

fn rank(status: ExchangeStatus) -> u8 {
    match status {
        ExchangeStatus::Pending => 0,
        ExchangeStatus::Accepted | ExchangeStatus::Declined => 1,
        ExchangeStatus::Exchanged => 2,
    }
}

#[test_log::test(tokio::test)]
async fn test_accept_then_both_parties_confirm() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let (engine, store, sink) = setup(&[&wood, &kafka]).await;

    let view = engine
        .request_exchange(offer(&wood, &kafka))
        .await
        .expect("Failed to request exchange");
    assert_eq!(view.status, ExchangeStatus::Pending);

    engine.accept(view.id, bob.id).await.expect("Failed to accept");
    assert!(!store.is_eligible(wood.id).await.unwrap());
    assert!(!store.is_eligible(kafka.id).await.unwrap());

    engine.confirm(view.id, alice.id).await.expect("Failed to confirm");
    let after_first = engine.get(view.id, bob.id).await.unwrap();
    assert_eq!(after_first.status, ExchangeStatus::Accepted);
    assert!(after_first.requested_by_confirmed);
    assert!(!after_first.requested_to_confirmed);

    engine.confirm(view.id, bob.id).await.expect("Failed to confirm");
    let done = engine.get(view.id, alice.id).await.unwrap();
    assert_eq!(done.status, ExchangeStatus::Exchanged);
    assert!(done.requested_by_confirmed && done.requested_to_confirmed);

    let messages: Vec<String> = sink.get_sent().into_iter().map(|n| n.message).collect();
    assert_eq!(
        messages,
        vec![
            "You have new exchange request for your book Kafka on the Shore.".to_string(),
            "Your Exchange Request For Book Kafka on the Shore is accepted.".to_string(),
            "Alice confirmed the exchange request.".to_string(),
            "Bob confirmed the exchange request.".to_string(),
        ]
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_duplicate_requests_yield_one_success() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let (engine, store, _sink) = setup(&[&wood, &kafka]).await;

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let request = offer(&wood, &kafka);
            tokio::spawn(async move { engine.request_exchange(request).await })
        })
        .collect();

    let mut successes = 0;
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.expect("task panicked") {
            Ok(_) => successes += 1,
            Err(ExchangeError::Conflict(message)) => {
                assert_eq!(message, "duplicate request");
                conflicts += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(conflicts, 7);
    assert_eq!(store.exchange_count(), 1);
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_concurrent_accepts_sharing_a_book() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let carol = owner("Carol");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let sputnik = book(3, "Sputnik Sweetheart", &carol);
    let (engine, store, _sink) = setup(&[&wood, &kafka, &sputnik]).await;

    let from_alice = engine.request_exchange(offer(&wood, &kafka)).await.unwrap().id;
    let from_carol = engine.request_exchange(offer(&sputnik, &kafka)).await.unwrap().id;

    let first = tokio::spawn({
        let engine = engine.clone();
        let bob = bob.id;
        async move { engine.accept(from_alice, bob).await }
    });
    let second = tokio::spawn({
        let engine = engine.clone();
        let bob = bob.id;
        async move { engine.accept(from_carol, bob).await }
    });
    let results = [first.await.unwrap(), second.await.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one accept must succeed: {results:?}");
    for result in &results {
        if let Err(err) = result {
            // Locked out under the row locks, or already superseded by the cascade
            assert!(
                matches!(
                    err,
                    ExchangeError::Conflict(_) | ExchangeError::InvalidOperation(_)
                ),
                "unexpected error: {err}"
            );
            assert!(!err.is_committed());
        }
    }

    let mut statuses = vec![
        status(&store, from_alice).await.unwrap(),
        status(&store, from_carol).await.unwrap(),
    ];
    statuses.sort_by_key(|s| s.as_str());
    assert_eq!(statuses, vec![ExchangeStatus::Accepted, ExchangeStatus::Declined]);
}

#[test_log::test(tokio::test)]
async fn test_accept_declines_every_rival_on_either_book() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let carol = owner("Carol");
    let dave = owner("Dave");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let sputnik = book(3, "Sputnik Sweetheart", &carol);
    let dance = book(4, "Dance Dance Dance", &dave);
    let (engine, store, sink) = setup(&[&wood, &kafka, &sputnik, &dance]).await;

    let winner = engine.request_exchange(offer(&wood, &kafka)).await.unwrap().id;
    let rivals = [
        engine.request_exchange(offer(&sputnik, &kafka)).await.unwrap().id,
        engine.request_exchange(offer(&dance, &kafka)).await.unwrap().id,
        engine.request_exchange(offer(&sputnik, &wood)).await.unwrap().id,
    ];
    let bystander = engine.request_exchange(offer(&dance, &sputnik)).await.unwrap().id;
    sink.clear_sent();

    engine.accept(winner, bob.id).await.expect("Failed to accept");

    for rival in rivals {
        assert_eq!(status(&store, rival).await, Some(ExchangeStatus::Declined));
    }
    assert_eq!(status(&store, bystander).await, Some(ExchangeStatus::Pending));

    // Carol had two rivals, Dave one, Alice gets the acceptance
    assert_eq!(sink.sent_to(carol.id).len(), 2);
    assert_eq!(sink.sent_to(dave.id).len(), 1);
    assert_eq!(sink.sent_to(alice.id).len(), 1);
    assert_eq!(sink.sent_count(), 4);

    // Rivals can be cleaned up by their initiators; the locked book stays locked
    engine.delete(rivals[0], carol.id).await.unwrap();
    assert!(!store.is_eligible(kafka.id).await.unwrap());
    assert!(store.is_eligible(sputnik.id).await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_self_request_is_always_invalid() {
    let alice = owner("Alice");
    let wood = book(1, "Norwegian Wood", &alice);
    let dance = book(4, "Dance Dance Dance", &alice);
    let (engine, store, sink) = setup(&[&wood, &dance]).await;

    let err = engine
        .request_exchange(offer(&wood, &dance))
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::InvalidOperation(_)));
    assert_eq!(store.exchange_count(), 0);
    assert_eq!(sink.sent_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_non_participant_accept_matches_missing_request() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let mallory = owner("Mallory");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let (engine, store, _sink) = setup(&[&wood, &kafka]).await;

    let id = engine.request_exchange(offer(&wood, &kafka)).await.unwrap().id;

    let forbidden = engine.accept(id, mallory.id).await.unwrap_err();
    let missing = engine
        .accept(ExchangeId(Uuid::new_v4()), mallory.id)
        .await
        .unwrap_err();

    assert!(matches!(forbidden, ExchangeError::NotFoundOrForbidden(_)));
    assert!(matches!(missing, ExchangeError::NotFoundOrForbidden(_)));
    assert_eq!(std::mem::discriminant(&forbidden), std::mem::discriminant(&missing));
    assert!(engine.get(id, mallory.id).await.is_err());
    assert_eq!(status(&store, id).await, Some(ExchangeStatus::Pending));
}

#[test_log::test(tokio::test)]
async fn test_status_only_moves_forward() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let (engine, store, _sink) = setup(&[&wood, &kafka]).await;

    let id = engine.request_exchange(offer(&wood, &kafka)).await.unwrap().id;
    let mut highest = rank(ExchangeStatus::Pending);

    // Every action by every party, in an order that tries to walk backwards
    let actions: Vec<(&str, UserId)> = vec![
        ("confirm", alice.id),
        ("accept", bob.id),
        ("decline", bob.id),
        ("accept", bob.id),
        ("confirm", bob.id),
        ("delete", alice.id),
        ("confirm", bob.id),
        ("confirm", alice.id),
        ("decline", bob.id),
        ("delete", alice.id),
        ("accept", bob.id),
    ];
    for (action, actor) in actions {
        let _ = match action {
            "accept" => engine.accept(id, actor).await,
            "decline" => engine.decline(id, actor).await,
            "confirm" => engine.confirm(id, actor).await,
            _ => engine.delete(id, actor).await,
        };
        let current = status(&store, id)
            .await
            .expect("accepted requests cannot be deleted");
        assert!(rank(current) >= highest, "{action} moved status back to {current}");
        highest = rank(current);
    }

    assert_eq!(status(&store, id).await, Some(ExchangeStatus::Exchanged));
}

#[test_log::test(tokio::test)]
async fn test_delete_after_decline_restores_flags() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let (engine, store, _sink) = setup(&[&wood, &kafka]).await;

    let id = engine.request_exchange(offer(&wood, &kafka)).await.unwrap().id;
    engine.decline(id, bob.id).await.unwrap();
    engine.delete(id, alice.id).await.unwrap();

    assert_eq!(status(&store, id).await, None);
    assert!(store.is_eligible(wood.id).await.unwrap());
    assert!(store.is_eligible(kafka.id).await.unwrap());

    // Books are free for a fresh request
    engine.request_exchange(offer(&wood, &kafka)).await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_notification_failure_does_not_undo_accept() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let (engine, store, sink) = setup(&[&wood, &kafka]).await;

    let id = engine.request_exchange(offer(&wood, &kafka)).await.unwrap().id;
    sink.fail_for(alice.id);

    let err = engine.accept(id, bob.id).await.unwrap_err();
    assert!(err.is_committed(), "accept must be reported as committed: {err}");
    assert_eq!(err.partial_failure().unwrap().failures.len(), 1);
    assert_eq!(status(&store, id).await, Some(ExchangeStatus::Accepted));

    // Retrying is not needed, and would be rejected
    sink.recover();
    let retry = engine.accept(id, bob.id).await.unwrap_err();
    assert!(matches!(retry, ExchangeError::InvalidOperation(_)));
}

#[test_log::test(tokio::test)]
async fn test_views_serialise_without_hidden_fields() {
    let alice = owner("Alice");
    let bob = owner("Bob");
    let wood = book(1, "Norwegian Wood", &alice);
    let kafka = book(2, "Kafka on the Shore", &bob);
    let (engine, _store, _sink) = setup(&[&wood, &kafka]).await;

    let id = engine.request_exchange(offer(&wood, &kafka)).await.unwrap().id;

    let json = serde_json::to_value(engine.get(id, alice.id).await.unwrap()).unwrap();
    let requested_owner = &json["requested_book"]["owner"];
    assert!(requested_owner.get("email").is_none());
    assert!(requested_owner.get("phone").is_none());
    assert!(requested_owner.get("role").is_none());
    assert!(json["requested_book"]["pickup_location"].get("coordinates").is_none());
    assert_eq!(json["offered_book"]["owner"]["email"], "alice@example.com");
    assert_eq!(json["status"], "pending");

    engine.accept(id, bob.id).await.unwrap();
    let json = serde_json::to_value(engine.get(id, alice.id).await.unwrap()).unwrap();
    assert_eq!(json["requested_book"]["owner"]["email"], "bob@example.com");
    assert_eq!(json["requested_book"]["owner"]["role"], "user");
}
