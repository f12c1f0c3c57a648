use incubator::protocol::{Response, ResponseStatus};
use incubator::server;
use incubator::sim::{SimConfig, SimulatedIncubator};
use incubator::{ControlLoop, Settings, SettingsStore, Status};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

async fn start_server() -> (Arc<ControlLoop>, std::net::SocketAddr, oneshot::Sender<()>) {
    let chamber = Arc::new(SimulatedIncubator::new(SimConfig {
        time_scale: 0.0,
        noise: false,
        ..SimConfig::default()
    }));
    let control = Arc::new(ControlLoop::new(
        chamber.clone(),
        chamber,
        Arc::new(SettingsStore::in_memory(Settings::default())),
        Duration::from_millis(500),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, Arc::clone(&control), async move {
        let _ = stop_rx.await;
    }));
    (control, addr, stop_tx)
}

async fn connect(addr: std::net::SocketAddr) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (reader, writer) = stream.into_split();
    (BufReader::new(reader), writer)
}

async fn roundtrip(reader: &mut BufReader<OwnedReadHalf>, writer: &mut OwnedWriteHalf, line: &str) -> Response {
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.write_all(b"\n").await.unwrap();
    next_response(reader).await
}

async fn next_response(reader: &mut BufReader<OwnedReadHalf>) -> Response {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("response timed out")
        .unwrap();
    serde_json::from_str(line.trim()).unwrap()
}

#[tokio::test]
async fn test_requests_over_tcp() {
    let (control, addr, _stop) = start_server().await;
    control.tick().await;
    let (mut reader, mut writer) = connect(addr).await;

    let response = roundtrip(&mut reader, &mut writer, r#"{"id":1,"command":"GetStatus"}"#).await;
    assert_eq!(response.id, 1);
    assert!(response.is_ok());

    let response = roundtrip(&mut reader, &mut writer, "garbage").await;
    assert_eq!(response.status, ResponseStatus::Error);

    let response = roundtrip(
        &mut reader,
        &mut writer,
        r#"{"id":2,"command":{"Control":{"target":"temperature","action":"start"}}}"#,
    )
    .await;
    assert_eq!(response.id, 2);
    assert!(response.is_ok());
    assert!(control.get_settings().await.temperature.enabled);
}

#[tokio::test]
async fn test_oversized_request_gets_error_and_connection_survives() {
    let (_control, addr, _stop) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    let huge = format!(r#"{{"id":1,"command":"GetStatus","pad":"{}"}}"#, "x".repeat(10_000));
    let response = roundtrip(&mut reader, &mut writer, &huge).await;
    assert_eq!(response.status, ResponseStatus::Error);

    let response = roundtrip(&mut reader, &mut writer, r#"{"id":3,"command":"GetSettings"}"#).await;
    assert!(response.is_ok());
}

#[tokio::test]
async fn test_subscription_streams_ticks() {
    let (control, addr, _stop) = start_server().await;
    let (mut reader, mut writer) = connect(addr).await;

    let response = roundtrip(&mut reader, &mut writer, r#"{"id":5,"command":"Subscribe"}"#).await;
    assert!(response.is_ok());

    control.tick().await;
    let update = next_response(&mut reader).await;
    assert_eq!(update.id, 5);
    let status: Status = serde_json::from_value(update.data.unwrap()).unwrap();
    assert_eq!(status.seq, 1);

    control.tick().await;
    let update = next_response(&mut reader).await;
    let status: Status = serde_json::from_value(update.data.unwrap()).unwrap();
    assert_eq!(status.seq, 2);
}
