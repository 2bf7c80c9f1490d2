//! SlimCodec over real tokio streams.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use vender_protocol::tele::{Command, CommandTask, Packet, State};
use vender_protocol::{Frame, SeqCounter, SlimCodec, StaticSecret};

fn create_framed_duplex(
    signed: bool,
) -> (
    Framed<DuplexStream, SlimCodec>,
    Framed<DuplexStream, SlimCodec>,
) {
    let (client, server) = tokio::io::duplex(4096);
    let codec = if signed {
        SlimCodec::new().with_secret(Arc::new(StaticSecret::new("password")))
    } else {
        SlimCodec::new()
    };
    (Framed::new(client, codec.clone()), Framed::new(server, codec))
}

#[tokio::test]
async fn test_codec_roundtrip_packet() {
    let (mut client, mut server) = create_framed_duplex(true);
    let seq = SeqCounter::new();

    let payload = Packet::State(State::Nominal).to_bytes().unwrap();
    client
        .send(Frame {
            seq: seq.next(),
            payload: payload.into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let received = server.next().await.unwrap().unwrap();
    assert_eq!(received.seq, 1);
    assert_eq!(
        Packet::from_bytes(&received.payload).unwrap(),
        Packet::State(State::Nominal)
    );
}

#[tokio::test]
async fn test_codec_bidirectional_ack() {
    let (mut client, mut server) = create_framed_duplex(false);

    let cmd = Command {
        id: 42,
        task: CommandTask::Ping,
        ..Default::default()
    };
    server
        .send(Frame {
            seq: 7,
            payload: Packet::Command(cmd.clone()).to_bytes().unwrap().into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let got = client.next().await.unwrap().unwrap();
    assert_eq!(Packet::from_bytes(&got.payload).unwrap(), Packet::Command(cmd));

    client
        .send(Frame {
            seq: 1,
            ack_seq: got.seq,
            acks: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    let ack = server.next().await.unwrap().unwrap();
    assert_eq!(ack.ack_seq, 7);
    assert_eq!(ack.acks, 1);
}

#[tokio::test]
async fn test_codec_signed_rejects_unsigned_peer() {
    let (client, server) = tokio::io::duplex(1024);
    let mut plain = Framed::new(client, SlimCodec::new());
    let mut signed = Framed::new(
        server,
        SlimCodec::new().with_secret(Arc::new(StaticSecret::new("password"))),
    );
    plain.send(Frame::keepalive(1)).await.unwrap();
    assert!(signed.next().await.unwrap().is_err());
}

#[tokio::test]
async fn test_codec_over_tcp_loopback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, SlimCodec::new());
        let mut seen = Vec::new();
        while let Some(Ok(f)) = framed.next().await {
            seen.push(f.seq);
            if seen.len() == 3 {
                break;
            }
        }
        seen
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, SlimCodec::new());
    for seq in 1..=3 {
        framed.send(Frame::keepalive(seq)).await.unwrap();
    }
    assert_eq!(server.await.unwrap(), vec![1, 2, 3]);
}
