// Per-connection task behavior: one driving task per socket means write
// cycles cannot interleave, even when a write stalls on a slow peer.
use bytes::Bytes;
use fabriclink::config::HostInfo;
use fabriclink::core::events::EventBus;
use fabriclink::dispatch::{Command, ConnEvent, Connection};
use fabriclink::protocol::{MadCodec, MadFrame, status};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::Framed;

#[cfg(test)]
mod connection_tests {
    use super::*;

    #[tokio::test]
    async fn test_assign_during_slow_write_is_serialized_behind_it() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = HostInfo::new("127.0.0.1", port);

        // The server accepts but does not read for a while, so the large
        // first write cannot complete before the second command is
        // assigned. Both frames must still arrive whole and in order.
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut framed = Framed::new(socket, MadCodec);
            let mut order = Vec::new();
            for _ in 0..2 {
                let frame = framed.next().await.unwrap().unwrap();
                order.push((frame.tid, frame.payload.len()));
                let reply = MadFrame {
                    tid: frame.tid,
                    attr: frame.attr,
                    status: status::STATUS_OK,
                    payload: Bytes::from_static(b"ok"),
                };
                framed.send(reply).await.unwrap();
            }
            order
        });

        let (result_tx, mut result_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new());
        let workers = Arc::new(Semaphore::new(4));
        let handle = Connection::spawn(
            1,
            host,
            false,
            Duration::from_secs(2),
            result_tx,
            events,
            workers,
            None,
        );

        match tokio::time::timeout(Duration::from_secs(2), result_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ConnEvent::ConnectFinished { conn_id } => assert_eq!(conn_id, 1),
            other => panic!("unexpected event before connect finished: {other:?}"),
        }

        // Large enough that write_all stalls on the kernel socket buffers
        // while the peer is not reading yet.
        let big_payload = Bytes::from(vec![0xAB; 4 * 1024 * 1024]);
        let expiry = tokio::time::Instant::now() + Duration::from_secs(10);
        let big = Command::new(1, 0x0042, big_payload.clone(), expiry);
        let small = Command::new(2, 0x0042, Bytes::from_static(b"tiny"), expiry);

        handle.assign(big.clone()).unwrap();
        handle.assign(small.clone()).unwrap();

        assert_eq!(big.response.wait().await.unwrap(), Bytes::from_static(b"ok"));
        assert_eq!(
            small.response.wait().await.unwrap(),
            Bytes::from_static(b"ok")
        );

        // The stalled write finished before the second began: frames in
        // assignment order, each with its full payload.
        let order = server.await.unwrap();
        assert_eq!(order, vec![(1, big_payload.len()), (2, 4)]);
    }
}
