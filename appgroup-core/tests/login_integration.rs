//! Integration tests for login.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use appgroup_core::duration::unix_millis;
use appgroup_core::{
    AppConfig, AppGroupError, Backend, BackendConfig, GenerateParams, GroupConfig, LoginRequest,
    SecretId,
};

fn app_config(num_uses: u32, ttl: Duration) -> AppConfig {
    AppConfig {
        policies: Some(vec!["default".to_string()]),
        secret_id_num_uses: Some(num_uses),
        secret_id_ttl: Some(ttl),
        ..AppConfig::default()
    }
}

fn app_login(name: &str, secret_id: &SecretId) -> LoginRequest {
    LoginRequest::App {
        name: name.to_string(),
        secret_id: SecretId::new(secret_id.expose()),
    }
}

fn copy_secrets(secret_ids: &BTreeMap<String, SecretId>) -> BTreeMap<String, SecretId> {
    secret_ids
        .iter()
        .map(|(app, secret_id)| (app.clone(), SecretId::new(secret_id.expose())))
        .collect()
}

#[test]
fn test_single_use_secret_wins_exactly_once() {
    let (_, backend) = common::memory_backend();
    backend
        .apps()
        .write_app("web", app_config(1, Duration::ZERO))
        .expect("create app");
    let issued = backend
        .apps()
        .generate_secret_id("web", GenerateParams::default(), 0)
        .expect("generate");

    let threads = 16;
    let barrier = Barrier::new(threads);
    let successes = AtomicUsize::new(0);
    let exhausted = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                barrier.wait();
                match backend
                    .login_engine()
                    .login(app_login("web", &issued.secret_id), 1)
                {
                    Ok(_) => successes.fetch_add(1, Ordering::SeqCst),
                    Err(AppGroupError::Exhausted) => exhausted.fetch_add(1, Ordering::SeqCst),
                    Err(err) => panic!("unexpected error: {err}"),
                };
            });
        }
    });

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(exhausted.load(Ordering::SeqCst), threads - 1);
    assert_eq!(backend.locks().credential_lock_count(), 0);
}

#[test]
fn test_distinct_secrets_all_succeed_concurrently() {
    let (_, backend) = common::memory_backend();
    backend
        .apps()
        .write_app("web", app_config(1, Duration::ZERO))
        .expect("create app");
    let issued: Vec<_> = (0..8)
        .map(|_| {
            backend
                .apps()
                .generate_secret_id("web", GenerateParams::default(), 0)
                .expect("generate")
        })
        .collect();

    let barrier = Barrier::new(issued.len());
    thread::scope(|scope| {
        for response in &issued {
            let backend = &backend;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                backend
                    .login_engine()
                    .login(app_login("web", &response.secret_id), 1)
                    .expect("login");
            });
        }
    });
    assert_eq!(backend.locks().credential_lock_count(), 0);
}

#[test]
fn test_two_use_secret_then_exhausted() {
    let (_, backend) = common::memory_backend();
    backend
        .apps()
        .write_app("web", app_config(2, Duration::from_secs(3_600)))
        .expect("create app");
    let issued = backend
        .apps()
        .generate_secret_id("web", GenerateParams::default(), 1_000)
        .expect("generate");

    let first = backend
        .apps()
        .validate_and_consume("web", &issued.secret_id, 2_000)
        .expect("first");
    assert_eq!(first.remaining_uses, Some(1));
    let second = backend
        .apps()
        .validate_and_consume("web", &issued.secret_id, 3_000)
        .expect("second");
    assert_eq!(second.remaining_uses, Some(0));
    assert!(matches!(
        backend
            .apps()
            .validate_and_consume("web", &issued.secret_id, 4_000),
        Err(AppGroupError::Exhausted)
    ));
}

#[test]
fn test_short_ttl_expires_with_uses_left() {
    let (_, backend) = common::memory_backend();
    backend
        .apps()
        .write_app("x", app_config(5, Duration::from_millis(1)))
        .expect("create app");
    let issued = backend
        .apps()
        .generate_secret_id("x", GenerateParams::default(), unix_millis())
        .expect("generate");

    thread::sleep(Duration::from_millis(5));

    assert!(matches!(
        backend
            .apps()
            .validate_and_consume("x", &issued.secret_id, unix_millis()),
        Err(AppGroupError::Expired)
    ));
    let info = backend
        .apps()
        .read_secret_id_by_accessor("x", &issued.accessor)
        .expect("lookup")
        .expect("present");
    assert_eq!(info.remaining_uses, Some(5));
}

fn pair_backend() -> Backend {
    let (_, backend) = common::memory_backend();
    for name in ["a", "b"] {
        backend
            .apps()
            .write_app(name, app_config(0, Duration::ZERO))
            .expect("create app");
    }
    backend
        .groups()
        .write_group(
            "pair",
            GroupConfig {
                apps: Some(vec!["a".to_string(), "b".to_string()]),
                ..GroupConfig::default()
            },
        )
        .expect("create group");
    backend
}

#[test]
fn test_group_login_is_all_or_nothing() {
    let backend = pair_backend();
    let a = backend
        .apps()
        .generate_secret_id(
            "a",
            GenerateParams {
                num_uses: Some(1),
                ..GenerateParams::default()
            },
            0,
        )
        .expect("generate a");

    let secret_ids = BTreeMap::from([
        ("a".to_string(), SecretId::new(a.secret_id.expose())),
        ("b".to_string(), SecretId::new("not-issued")),
    ]);
    assert!(matches!(
        backend.login_engine().login(
            LoginRequest::Group {
                name: "pair".to_string(),
                secret_ids,
            },
            1,
        ),
        Err(AppGroupError::InvalidCredential)
    ));

    let info = backend
        .apps()
        .read_secret_id_by_accessor("a", &a.accessor)
        .expect("lookup")
        .expect("present");
    assert_eq!(info.remaining_uses, Some(1));
    assert_eq!(info.last_used_at, None);
}

#[test]
fn test_concurrent_group_logins_succeed_once() {
    let backend = pair_backend();
    let issued = backend
        .groups()
        .generate_secret_id(
            "pair",
            GenerateParams {
                num_uses: Some(1),
                ..GenerateParams::default()
            },
            0,
        )
        .expect("generate");

    let threads = 8;
    let barrier = Barrier::new(threads);
    let successes = AtomicUsize::new(0);
    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| {
                barrier.wait();
                let request = LoginRequest::Group {
                    name: "pair".to_string(),
                    secret_ids: copy_secrets(&issued.secret_ids),
                };
                match backend.login_engine().login(request, 1) {
                    Ok(auth) => {
                        assert_eq!(auth.accessors, issued.member_accessors);
                        successes.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(AppGroupError::Exhausted) => {}
                    Err(err) => panic!("unexpected error: {err}"),
                }
            });
        }
    });

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(backend.locks().credential_lock_count(), 0);
}

#[test]
fn test_failed_member_write_restores_earlier_members() {
    let storage = Arc::new(common::FailingStorage::default());
    let backend = Backend::new(storage.clone(), BackendConfig::default()).expect("backend");
    for name in ["a", "b"] {
        backend
            .apps()
            .write_app(name, app_config(2, Duration::ZERO))
            .expect("create app");
    }
    backend
        .groups()
        .write_group(
            "pair",
            GroupConfig {
                apps: Some(vec!["a".to_string(), "b".to_string()]),
                ..GroupConfig::default()
            },
        )
        .expect("create group");
    let issued = backend
        .groups()
        .generate_secret_id("pair", GenerateParams::default(), 0)
        .expect("generate");

    // Member "a" is written, the write of "b" fails.
    storage.arm("secret_id/", 1);
    let request = LoginRequest::Group {
        name: "pair".to_string(),
        secret_ids: copy_secrets(&issued.secret_ids),
    };
    assert!(matches!(
        backend.login_engine().login(request, 1),
        Err(AppGroupError::Storage(_))
    ));

    for (app, accessor) in &issued.member_accessors {
        let info = backend
            .apps()
            .read_secret_id_by_accessor(app, accessor)
            .expect("lookup")
            .expect("present");
        assert_eq!(info.remaining_uses, Some(2), "member {app} was consumed");
    }

    let request = LoginRequest::Group {
        name: "pair".to_string(),
        secret_ids: copy_secrets(&issued.secret_ids),
    };
    backend
        .login_engine()
        .login(request, 2)
        .expect("login after failure");
}

#[test]
fn test_renew_after_delete_and_uses_untouched() {
    let (_, backend) = common::memory_backend();
    backend
        .apps()
        .write_app("web", app_config(3, Duration::ZERO))
        .expect("create app");
    let issued = backend
        .apps()
        .generate_secret_id("web", GenerateParams::default(), 0)
        .expect("generate");
    let auth = backend
        .login_engine()
        .login(app_login("web", &issued.secret_id), 0)
        .expect("login");

    for now in [10, 20, 30] {
        backend.login_engine().renew(&auth, now).expect("renew");
    }
    let info = backend
        .apps()
        .read_secret_id_by_accessor("web", &issued.accessor)
        .expect("lookup")
        .expect("present");
    assert_eq!(info.remaining_uses, Some(2));

    backend.apps().delete_app("web").expect("delete");
    assert!(matches!(
        backend.login_engine().renew(&auth, 40),
        Err(AppGroupError::NotFound { .. })
    ));
}

#[test]
fn test_salt_survives_file_storage_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let open = || {
        let storage = appgroup_core::storage::FileStorage::open(dir.path()).expect("open");
        Backend::new(Arc::new(storage), BackendConfig::default()).expect("backend")
    };

    let secret = {
        let backend = open();
        backend
            .apps()
            .write_app("web", app_config(0, Duration::ZERO))
            .expect("create app");
        backend
            .apps()
            .generate_secret_id("web", GenerateParams::default(), 0)
            .expect("generate")
            .secret_id
    };

    let backend = open();
    backend
        .login_engine()
        .login(app_login("web", &secret), 1)
        .expect("login after reopen");
}

#[test]
fn test_failed_index_write_leaves_no_secret_record() {
    let storage = Arc::new(common::FailingStorage::default());
    let backend = Backend::new(storage.clone(), BackendConfig::default()).expect("backend");
    backend
        .apps()
        .write_app("web", app_config(1, Duration::ZERO))
        .expect("create app");

    storage.arm("accessor/", 0);
    assert!(matches!(
        backend
            .apps()
            .generate_secret_id("web", GenerateParams::default(), 0),
        Err(AppGroupError::Storage(_))
    ));
    assert!(storage.keys("secret_id/").is_empty());
    assert!(storage.keys("accessor/").is_empty());

    backend
        .apps()
        .generate_secret_id("web", GenerateParams::default(), 1)
        .expect("generate after failure");
    assert_eq!(storage.keys("secret_id/").len(), 1);
}
