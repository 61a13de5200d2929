#![cfg(unix)]

mod common;

use common::*;
use corevisor::{
    Command, ControlClient, ControlReply, ControlServer, ErrorKind, ManagedState, StatusEvent,
    Supervisor, SupervisorConfig,
};
use std::net::SocketAddr;
use std::time::Duration;

async fn serve(config: SupervisorConfig) -> (Supervisor, SocketAddr) {
    init_tracing();
    let supervisor = Supervisor::builder(config).resolver(sleeper()).build();
    let server = ControlServer::bind("127.0.0.1:0", supervisor.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve(supervisor.shutdown_coordinator().token()));
    (supervisor, addr)
}

#[tokio::test]
async fn test_unary_requests_map_to_supervisor() {
    let (supervisor, addr) = serve(test_config()).await;
    let mut client = ControlClient::connect(addr).await.unwrap();

    let reply = client.request(Command::Stop).await.unwrap();
    assert!(!reply.ok);
    assert_eq!(reply.kind(), Some(ErrorKind::NotRunning));

    let reply = client.request(Command::Start).await.unwrap();
    assert_eq!(reply, ControlReply::success("started"));
    assert_eq!(supervisor.state(), ManagedState::Running);

    let reply = client.request(Command::Start).await.unwrap();
    assert_eq!(reply.kind(), Some(ErrorKind::AlreadyRunning));

    let reply = client.request(Command::Stop).await.unwrap();
    assert!(reply.ok);
    assert_eq!(supervisor.state(), ManagedState::Stopped);
}

#[tokio::test]
async fn test_malformed_request_keeps_connection() {
    let (_supervisor, addr) = serve(test_config()).await;
    let mut client = ControlClient::connect(addr).await.unwrap();

    let line = client
        .request_raw(r#"{"method":"reboot"}"#)
        .await
        .unwrap()
        .unwrap();
    let reply: ControlReply = serde_json::from_str(&line).unwrap();
    assert_eq!(reply.kind(), Some(ErrorKind::InvalidRequest));

    let reply = client.request(Command::Stop).await.unwrap();
    assert_eq!(reply.kind(), Some(ErrorKind::NotRunning));
}

#[tokio::test]
async fn test_status_stream_and_disconnect_policy() {
    let (supervisor, addr) = serve(test_config()).await;
    supervisor.start().await.unwrap();

    let mut stream = ControlClient::connect(addr)
        .await
        .unwrap()
        .stream_status()
        .await
        .unwrap();
    assert_eq!(
        stream.next_status().await.unwrap(),
        Some(StatusEvent::Started)
    );

    drop(stream);
    wait_for_state(&supervisor, ManagedState::Stopped).await;
}

#[tokio::test]
async fn test_disconnect_policy_can_be_disabled() {
    let config = SupervisorConfig {
        stop_on_stream_disconnect: false,
        ..test_config()
    };
    let (supervisor, addr) = serve(config).await;
    supervisor.start().await.unwrap();

    let mut stream = ControlClient::connect(addr)
        .await
        .unwrap()
        .stream_status()
        .await
        .unwrap();
    assert_eq!(
        stream.next_status().await.unwrap(),
        Some(StatusEvent::Started)
    );
    drop(stream);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(supervisor.state(), ManagedState::Running);
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn test_exit_request_ends_streams_and_terminates() {
    let (supervisor, addr) = serve(test_config()).await;

    let mut stream = ControlClient::connect(addr)
        .await
        .unwrap()
        .stream_status()
        .await
        .unwrap();
    let mut client = ControlClient::connect(addr).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while supervisor.bus().subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let reply = client.request(Command::Start).await.unwrap();
    assert!(reply.ok);
    assert_eq!(
        stream.next_status().await.unwrap(),
        Some(StatusEvent::Starting)
    );
    assert_eq!(
        stream.next_status().await.unwrap(),
        Some(StatusEvent::Started)
    );

    let reply = client.request(Command::Exit).await.unwrap();
    assert_eq!(reply, ControlReply::success("exiting"));

    assert_eq!(
        stream.next_status().await.unwrap(),
        Some(StatusEvent::Stopping)
    );
    assert_eq!(
        stream.next_status().await.unwrap(),
        Some(StatusEvent::Stopped)
    );
    assert_eq!(stream.next_status().await.unwrap(), None);

    wait_for_termination(&supervisor).await;
    assert!(ControlClient::connect(addr).await.is_err());
}
