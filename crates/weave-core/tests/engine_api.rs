//! Engine API tests
//!
//! Single-instance coverage of the public surface: identity lifecycle,
//! the three data spaces, claims, subscriptions and close semantics.

use std::time::Duration;

use weave_core::identity::KdfOptions;
use weave_core::{
    EngineOptions, GetOptions, Pattern, PutOptions, Space, Value, WeaveEngine, WeaveError,
};

// ============================================================================
// Test Utilities
// ============================================================================

/// Engine over an in-memory store with a test-friendly KDF.
async fn engine() -> WeaveEngine {
    WeaveEngine::create(test_options()).await.expect("engine")
}

fn test_options() -> EngineOptions {
    EngineOptions {
        kdf: KdfOptions {
            iterations: 10,
            salt_length: 16,
        },
        request_timeout: Duration::from_millis(300),
        ..EngineOptions::default()
    }
}

async fn signed_up(name: &str) -> WeaveEngine {
    let engine = engine().await;
    engine.signup(name, "password").await.expect("signup");
    engine
}

fn get_in(space: Space) -> GetOptions {
    GetOptions {
        space,
        ..GetOptions::default()
    }
}

fn put_in(space: Space) -> PutOptions {
    PutOptions {
        space,
        ..PutOptions::default()
    }
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn signup_yields_handle_with_deterministic_suffix() {
    let engine = signed_up("carol").await;
    let handle = engine.handle().await.unwrap();
    let pk = engine.public_key().await.unwrap();

    let (name, suffix) = handle.rsplit_once('#').unwrap();
    assert_eq!(name, "carol");
    assert_eq!(suffix, weave_core::deterministic_suffix(&pk));
}

#[tokio::test]
async fn signup_twice_fails() {
    let engine = signed_up("carol").await;
    let result = engine.signup("carol2", "pw").await;
    assert!(matches!(result, Err(WeaveError::InvalidArgument(_))));
}

#[tokio::test]
async fn login_logout_roundtrip() {
    let store = std::sync::Arc::new(weave_core::MemoryStore::new());
    let mut options = test_options();
    options.store = Some(store.clone());
    let engine = WeaveEngine::create(options).await.unwrap();

    let signup = engine.signup("carol", "hunter2").await.unwrap();
    engine.logout().await;
    assert!(!engine.is_logged_in().await);

    assert!(matches!(
        engine.login("wrong").await,
        Err(WeaveError::WrongPassword)
    ));
    let pk = engine.login("hunter2").await.unwrap();
    assert_eq!(pk, signup.public_key);
    assert!(engine.is_logged_in().await);
}

#[tokio::test]
async fn put_requires_login() {
    let engine = engine().await;
    let result = engine.put("k", Value::Int(1), PutOptions::default()).await;
    assert!(matches!(result, Err(WeaveError::NotAuthenticated)));
}

#[tokio::test]
async fn change_password_rewraps_keys() {
    let engine = signed_up("carol").await;
    let pk = engine.public_key().await.unwrap();

    engine.change_password("password", "better one").await.unwrap();
    engine.logout().await;

    assert!(matches!(
        engine.login("password").await,
        Err(WeaveError::WrongPassword)
    ));
    assert_eq!(engine.login("better one").await.unwrap(), pk);
}

#[tokio::test]
async fn export_import_preserves_identity_and_data_key() {
    let alice = signed_up("alice").await;
    alice
        .put("diary", "secret".into(), put_in(Space::User))
        .await
        .unwrap();
    let backup = alice.export_identity("password").await.unwrap();
    let pk = alice.public_key().await.unwrap();

    // Wrong password on export is refused.
    assert!(matches!(
        alice.export_identity("nope").await,
        Err(WeaveError::WrongPassword)
    ));

    // Import into a fresh engine restores the same key material.
    let other = engine().await;
    let imported = other.import_identity(&backup, "password").await.unwrap();
    assert_eq!(imported, pk);
    assert!(other.is_logged_in().await);
}

// ============================================================================
// Spaces
// ============================================================================

#[tokio::test]
async fn put_get_roundtrip_in_all_space() {
    let engine = signed_up("carol").await;
    let value = Value::Map(vec![
        ("v".to_string(), Value::Int(1)),
        ("tags".to_string(), Value::Array(vec!["x".into()])),
    ]);

    let root = engine
        .put("Config", value.clone(), PutOptions::default())
        .await
        .unwrap();
    assert!(root.is_some());

    // Keys normalize: the lookup is case-insensitive.
    assert_eq!(
        engine.get("config", GetOptions::default()).await.unwrap(),
        Some(value)
    );
    assert_eq!(engine.get("other", GetOptions::default()).await.unwrap(), None);
}

#[tokio::test]
async fn frozen_space_is_first_write_wins() {
    let engine = signed_up("carol").await;

    engine
        .put("genesis", "block0".into(), put_in(Space::Frozen))
        .await
        .unwrap();
    assert_eq!(
        engine.get("genesis", get_in(Space::Frozen)).await.unwrap(),
        Some("block0".into())
    );

    let second = engine
        .put("genesis", "block1".into(), put_in(Space::Frozen))
        .await;
    assert!(matches!(second, Err(WeaveError::Immutable(_))));

    assert_eq!(
        engine.get("genesis", get_in(Space::Frozen)).await.unwrap(),
        Some("block0".into())
    );
}

#[tokio::test]
async fn user_space_stores_ciphertext_only() {
    let engine = signed_up("alice").await;
    let pk = engine.public_key().await.unwrap();

    engine
        .put("diary", "cake is a lie".into(), put_in(Space::User))
        .await
        .unwrap();

    // The caller reads back plaintext.
    assert_eq!(
        engine.get("diary", get_in(Space::User)).await.unwrap(),
        Some("cake is a lie".into())
    );

    // The stored envelope holds a hex ciphertext, not the plaintext.
    let path = format!("user/{}/diary", pk.to_base64());
    let entry = engine.get_entry(&path).await.unwrap().unwrap();
    assert!(entry.payload.is_encrypted);
    assert_ne!(entry.payload.value, Value::from("cake is a lie"));
    let hex_str = entry.payload.value.as_text().unwrap();
    assert!(hex_str.bytes().all(|b| b.is_ascii_hexdigit()));
}

#[tokio::test]
async fn overwrite_in_all_space_returns_fresh_root() {
    let engine = signed_up("carol").await;
    let first = engine
        .put("k", Value::Int(1), PutOptions::default())
        .await
        .unwrap()
        .unwrap();
    let second = engine
        .put("k", Value::Int(2), PutOptions::default())
        .await
        .unwrap()
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(engine.head().await, Some(second));
    assert_eq!(
        engine.get("k", GetOptions::default()).await.unwrap(),
        Some(Value::Int(2))
    );
}

#[tokio::test]
async fn volatile_put_does_not_touch_the_trie() {
    let engine = signed_up("carol").await;
    let (_, mut events) = engine
        .subscribe(Pattern::Glob("all/cursor/*".to_string()))
        .await
        .unwrap();

    let head_before = engine.head().await;
    let root = engine
        .put(
            "cursor/carol",
            Value::Int(42),
            PutOptions {
                volatile: true,
                ..PutOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(root, None);
    assert_eq!(engine.head().await, head_before);
    assert_eq!(
        engine.get("cursor/carol", GetOptions::default()).await.unwrap(),
        None
    );

    // But the local event still fires.
    let event = events.recv().await.unwrap();
    assert_eq!(event.path, "all/cursor/carol");
    assert!(!event.remote);
}

#[tokio::test]
async fn silent_put_persists_without_events() {
    let engine = signed_up("carol").await;
    let (_, mut events) = engine
        .subscribe(Pattern::Glob("*".to_string()))
        .await
        .unwrap();

    engine
        .put(
            "quiet",
            Value::Int(1),
            PutOptions {
                silent: true,
                ..PutOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        engine.get("quiet", GetOptions::default()).await.unwrap(),
        Some(Value::Int(1))
    );
    assert!(events.try_recv().is_err());
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn head_survives_reopen_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let value = Value::from("durable");

    let head = {
        let mut options = test_options();
        options.data_dir = Some(dir.path().to_path_buf());
        let engine = WeaveEngine::create(options).await.unwrap();
        engine.signup("carol", "pw").await.unwrap();
        let head = engine
            .put("k", value.clone(), PutOptions::default())
            .await
            .unwrap();
        engine.close().await.unwrap();
        head.unwrap()
    };

    // Give any stray idle-flush task time to wind down before the
    // database file is reopened.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut options = test_options();
    options.data_dir = Some(dir.path().to_path_buf());
    let engine = WeaveEngine::create(options).await.unwrap();
    assert_eq!(engine.head().await, Some(head));
    assert_eq!(engine.get("k", GetOptions::default()).await.unwrap(), Some(value));

    // The identity is still there; log back in.
    engine.login("pw").await.unwrap();
    assert!(engine.is_logged_in().await);
}

#[tokio::test]
async fn closed_engine_refuses_operations() {
    let engine = signed_up("carol").await;
    engine.close().await.unwrap();

    assert!(matches!(
        engine.get("k", GetOptions::default()).await,
        Err(WeaveError::Closed)
    ));
    assert!(matches!(
        engine.put("k", Value::Int(1), PutOptions::default()).await,
        Err(WeaveError::Closed)
    ));
    // Closing twice is fine.
    engine.close().await.unwrap();
}

// ============================================================================
// Username Claims
// ============================================================================

#[tokio::test]
async fn claim_and_whois() {
    let engine = signed_up("alice").await;
    let pk = engine.public_key().await.unwrap();

    assert_eq!(engine.whois("carol").await.unwrap(), None);
    engine.claim_username("Carol").await.unwrap();

    let winner = engine.whois("carol").await.unwrap().unwrap();
    assert_eq!(winner.pub_key, pk);
    assert_eq!(winner.username, "carol");
}

#[tokio::test]
async fn revoked_claim_no_longer_wins() {
    let engine = signed_up("alice").await;
    engine.claim_username("carol").await.unwrap();
    engine.revoke_username("carol").await.unwrap();
    assert_eq!(engine.whois("carol").await.unwrap(), None);
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn subscription_receives_local_writes_in_order() {
    let engine = signed_up("carol").await;
    let (_, mut events) = engine
        .subscribe(Pattern::Glob("all/chat/*".to_string()))
        .await
        .unwrap();

    for i in 0..3i64 {
        engine
            .put(&format!("chat/msg{}", i), Value::Int(i), PutOptions::default())
            .await
            .unwrap();
    }
    engine
        .put("unrelated", Value::Int(9), PutOptions::default())
        .await
        .unwrap();

    for i in 0..3i64 {
        let event = events.recv().await.unwrap();
        assert_eq!(event.path, format!("all/chat/msg{}", i));
        assert_eq!(event.value, Some(Value::Int(i)));
        assert!(!event.remote);
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_stops_events() {
    let engine = signed_up("carol").await;
    let (id, mut events) = engine
        .subscribe(Pattern::Exact("all/k".to_string()))
        .await
        .unwrap();

    assert!(engine.unsubscribe(id));
    engine.put("k", Value::Int(1), PutOptions::default()).await.unwrap();
    assert!(events.try_recv().is_err());
}
