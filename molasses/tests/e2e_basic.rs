//! End-to-end smoke test: a real client walks the greylisted dialogue
//! over a real socket and ends up deferred.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::broadcast,
    time::timeout,
};

use molasses::Server;
use molasses_common::config::Config;

const STEP: Duration = Duration::from_secs(10);

async fn expect_line(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    want_prefix: &str,
) -> String {
    let mut line = String::new();
    timeout(STEP, reader.read_line(&mut line))
        .await
        .expect("timed out waiting for reply")
        .expect("read failed");
    assert!(
        line.starts_with(want_prefix),
        "expected reply starting with {want_prefix:?}, got {line:?}"
    );
    line
}

#[tokio::test]
async fn greylisted_dialogue_ends_in_deferral() {
    let config = Config {
        hostname: String::from("tarpit.test"),
        banner: String::from("smoke"),
        port: 0,
        config_port: 0,
        stutter: 0,
        max_cons: 16,
        max_black: 16,
        ..Config::default()
    };

    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();

    let (shutdown, _) = broadcast::channel(4);
    let running = tokio::spawn(server.run(shutdown.clone()));

    let stream = timeout(STEP, TcpStream::connect(addr)).await.unwrap().unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    expect_line(&mut reader, "220 tarpit.test ESMTP smoke; ").await;

    write_half.write_all(b"HELO client.example.net\r\n").await.unwrap();
    expect_line(&mut reader, "250 tarpit.test").await;

    write_half.write_all(b"MAIL FROM:<m@example.net>\r\n").await.unwrap();
    expect_line(&mut reader, "250 OK").await;

    write_half.write_all(b"RCPT TO:<r@example.org>\r\n").await.unwrap();
    expect_line(&mut reader, "250 OK").await;

    write_half.write_all(b"DATA\r\n").await.unwrap();
    expect_line(&mut reader, "451 Temporary failure, please try again later.").await;

    // The deferral is terminal: the server hangs up on us.
    let mut rest = String::new();
    let eof = timeout(STEP, reader.read_line(&mut rest)).await.unwrap().unwrap();
    assert_eq!(eof, 0, "expected the connection to close, got {rest:?}");

    shutdown.send(molasses_common::Signal::Shutdown).unwrap();
    timeout(STEP, running).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn quit_gets_the_goodbye() {
    let config = Config {
        hostname: String::from("tarpit.test"),
        port: 0,
        config_port: 0,
        stutter: 0,
        max_cons: 16,
        max_black: 16,
        ..Config::default()
    };

    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();

    let (shutdown, _) = broadcast::channel(4);
    let running = tokio::spawn(server.run(shutdown.clone()));

    let stream = timeout(STEP, TcpStream::connect(addr)).await.unwrap().unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    expect_line(&mut reader, "220 tarpit.test ESMTP").await;

    write_half.write_all(b"QUIT\r\n").await.unwrap();
    expect_line(&mut reader, "221 tarpit.test").await;

    shutdown.send(molasses_common::Signal::Shutdown).unwrap();
    timeout(STEP, running).await.unwrap().unwrap().unwrap();
}
