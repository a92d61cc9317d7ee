mod common;
use common::*;

use lux_dongle_bridge::bridge::{ChannelData, SharedStatus, Status};
use lux_dongle_bridge::tcp_server::{ServerSettings, TcpServer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn settings(max_clients: usize) -> ServerSettings {
    ServerSettings {
        listen: "127.0.0.1".to_string(),
        port: 0,
        max_clients,
        client_timeout: Duration::from_secs(30),
        keepalive: Duration::from_secs(60),
    }
}

async fn start_server(max_clients: usize) -> (Channels, SharedStatus, SocketAddr) {
    let channels = Channels::new();
    let status = Status::shared();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = TcpServer::new(settings(max_clients), channels.clone(), status.clone());
    tokio::spawn(async move { server.serve(listener).await });

    (channels, status, addr)
}

/// Stands in for the bus worker: echoes the first frame back, closes on the second.
fn fake_bridge(channels: &Channels) -> tokio::task::JoinHandle<Vec<Vec<u8>>> {
    let mut receiver = channels.to_bridge.subscribe();
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Ok(ChannelData::Request(request)) = receiver.recv().await {
            if seen.is_empty() {
                request.client.send(&request.bytes).unwrap();
            } else {
                request.client.close();
            }
            seen.push(request.bytes.to_vec());
        }
        seen
    })
}

async fn wait_for(status: &SharedStatus, f: impl Fn(&Status) -> bool) {
    timeout(WAIT, async {
        while !f(&status.lock().unwrap()) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("status condition not reached");
}

#[tokio::test]
async fn frames_reassembled_and_answered() {
    common_setup();

    let (channels, status, addr) = start_server(5).await;
    let bridge = fake_bridge(&channels);

    let request = Factory::client_read(DeviceFunction::ReadInput, 0, 40);
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // split across writes, with leading noise
    stream.write_all(&[0x00, 0xff]).await.unwrap();
    stream.write_all(&request[..11]).await.unwrap();
    sleep(Duration::from_millis(20)).await;
    stream.write_all(&request[11..]).await.unwrap();

    let mut reply = vec![0; request.len()];
    timeout(WAIT, stream.read_exact(&mut reply)).await.unwrap().unwrap();
    assert_eq!(reply, request);

    // second frame: the bridge closes the connection
    stream.write_all(&request).await.unwrap();
    let mut rest = Vec::new();
    let n = timeout(WAIT, stream.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert_eq!(n, 0);

    wait_for(&status, |s| s.server.active_clients == 0).await;
    {
        let s = status.lock().unwrap();
        assert_eq!(s.server.connections_total, 1);
        assert_eq!(s.server.frames_in, 2);
        assert_eq!(s.server.bytes_out, request.len() as u64);
    }

    channels.shutdown();
    let seen = timeout(WAIT, bridge).await.unwrap().unwrap();
    assert_eq!(seen, vec![request.clone(), request]);
}

#[tokio::test]
async fn two_frames_in_one_write() {
    let (channels, status, addr) = start_server(5).await;
    let mut receiver = channels.to_bridge.subscribe();

    let first = Factory::client_read(DeviceFunction::ReadHold, 0, 1);
    let second = Factory::client_write_single(20, 7);
    let mut both = first.clone();
    both.extend_from_slice(&second);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&both).await.unwrap();

    for expected in [first, second] {
        match timeout(WAIT, receiver.recv()).await.unwrap().unwrap() {
            ChannelData::Request(request) => assert_eq!(&request.bytes[..], &expected[..]),
            other => panic!("unexpected {:?}", other),
        }
    }
    wait_for(&status, |s| s.server.frames_in == 2).await;
    channels.shutdown();
}

#[tokio::test]
async fn rejects_clients_over_limit() {
    common_setup();

    let (channels, status, addr) = start_server(1).await;

    let _first = TcpStream::connect(addr).await.unwrap();
    wait_for(&status, |s| s.server.active_clients == 1).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(WAIT, second.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "second client should be dropped");

    wait_for(&status, |s| s.server.rejected_clients == 1).await;
    assert_eq!(status.lock().unwrap().server.active_clients, 1);

    channels.shutdown();
}

#[tokio::test]
async fn disconnect_frees_slot() {
    let (channels, status, addr) = start_server(1).await;

    let first = TcpStream::connect(addr).await.unwrap();
    wait_for(&status, |s| s.server.active_clients == 1).await;
    drop(first);
    wait_for(&status, |s| s.server.active_clients == 0).await;

    let _second = TcpStream::connect(addr).await.unwrap();
    wait_for(&status, |s| s.server.connections_total == 2).await;
    assert_eq!(status.lock().unwrap().server.rejected_clients, 0);

    channels.shutdown();
}
