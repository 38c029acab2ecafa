//! Login and reconnect behaviour of the session service

mod common;

use common::{config, Gateway, TestConnector, TOKEN, USER};
use revtun_client::{
    sign_key, ClientConfig, ControlError, Message, RetryConfig, Service, SessionEnd,
    TokenAuthSetter,
};
use revtun_proto::{read_message, write_message, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;

fn service_config() -> ClientConfig {
    ClientConfig {
        heartbeat_interval: Duration::ZERO,
        reconnect: RetryConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts: None,
        },
        ..config()
    }
}

fn service(config: ClientConfig) -> (Arc<Service>, tokio::sync::mpsc::UnboundedReceiver<DuplexStream>) {
    let (connector, dialed) = TestConnector::new();
    let auth = Arc::new(TokenAuthSetter::from_config(&config));
    (
        Arc::new(Service::new(
            config,
            connector,
            auth,
            HashMap::new(),
            HashMap::new(),
        )),
        dialed,
    )
}

/// Read the Login on a fresh connection and answer it; returns the replayed run id
async fn answer_login(conn: &mut DuplexStream, run_id: &str, error: &str) -> String {
    let previous = match read_message(conn).await.unwrap() {
        Message::Login {
            version,
            user,
            privilege_key,
            timestamp,
            run_id,
            ..
        } => {
            assert_eq!(version, PROTOCOL_VERSION);
            assert_eq!(user, USER);
            assert_eq!(privilege_key, sign_key(TOKEN, timestamp));
            run_id
        }
        other => panic!("Expected Login, got {:?}", other),
    };

    write_message(
        conn,
        &Message::LoginResp {
            version: PROTOCOL_VERSION.to_string(),
            run_id: run_id.to_string(),
            error: error.to_string(),
        },
    )
    .await
    .unwrap();
    previous
}

#[tokio::test]
async fn test_reconnect_replays_run_id() {
    let (service, mut dialed) = service(service_config());
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    // First session: fresh login, then the gateway drops the connection
    let mut conn = dialed.recv().await.unwrap();
    assert_eq!(answer_login(&mut conn, "run-42", "").await, "");
    let gateway = Gateway::spawn(conn, true);
    drop(gateway);

    // Second session resumes the same run id
    let mut conn = dialed.recv().await.unwrap();
    assert_eq!(answer_login(&mut conn, "run-42", "").await, "run-42");
    assert_eq!(service.run_id(), "run-42");

    // Kick the client for good
    let gateway = Gateway::spawn(conn, true);
    gateway.send(Message::CloseClient {
        token: USER.to_string(),
    });

    let end = runner.await.unwrap().unwrap();
    assert_eq!(end, SessionEnd::ForcedOffline);
}

#[tokio::test]
async fn test_first_login_failure_exits() {
    let (service, mut dialed) = service(service_config());
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    let mut conn = dialed.recv().await.unwrap();
    answer_login(&mut conn, "", "invalid token").await;

    match runner.await.unwrap() {
        Err(ControlError::AuthenticationFailed(reason)) => assert_eq!(reason, "invalid token"),
        other => panic!("Expected authentication failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_login_failure_retries_without_login_fail_exit() {
    let config = ClientConfig {
        login_fail_exit: false,
        ..service_config()
    };
    let (service, mut dialed) = service(config);
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    let mut conn = dialed.recv().await.unwrap();
    answer_login(&mut conn, "", "gateway busy").await;

    // A second attempt follows after the backoff
    let mut conn = dialed.recv().await.unwrap();
    answer_login(&mut conn, "run-7", "").await;
    let _gateway = Gateway::spawn(conn, true);

    while service.control().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    service.graceful_close(Duration::ZERO).await;

    assert_eq!(runner.await.unwrap().unwrap(), SessionEnd::Closed);
}

#[tokio::test]
async fn test_graceful_close_stops_reconnecting() {
    let (service, mut dialed) = service(service_config());
    let runner = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    let mut conn = dialed.recv().await.unwrap();
    answer_login(&mut conn, "run-1", "").await;
    let _gateway = Gateway::spawn(conn, true);

    while service.control().is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let control = service.control().unwrap();

    service.graceful_close(Duration::ZERO).await;

    assert_eq!(runner.await.unwrap().unwrap(), SessionEnd::Closed);
    assert!(control.is_closed());
    assert!(service.control().is_none());
    assert!(dialed.try_recv().is_err(), "no reconnect after close");
}
