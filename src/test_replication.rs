//! End-to-end replication scenarios over localhost TCP
//!
//! These tests wire a real primary and secondary together with real stores
//! on disk and drive the full path: commit on the primary, stream over the
//! wire, apply on the secondary.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    use crate::framing::{marshal, FrameStream};
    use crate::primary::Primary;
    use crate::secondary::{Secondary, SecondaryOptions};
    use crate::store::{BlobStorage, FileStore, Storage, BLOB_MARKER};
    use crate::types::{Oid, Tid, TransactionMeta, TxnStatus};

    fn test_options() -> SecondaryOptions {
        SecondaryOptions {
            reconnect_delay: Duration::from_millis(250),
            check_checksums: true,
            keep_alive_delay: Duration::ZERO,
        }
    }

    async fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !predicate() {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {what}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn commit(storage: &dyn Storage, oid: Oid, data: &[u8]) -> Tid {
        let meta = TransactionMeta::new(Tid::ZERO, TxnStatus::Normal);
        storage.tpc_begin(&meta).unwrap();
        storage.store(oid, data).unwrap();
        storage.tpc_vote().unwrap();
        storage.tpc_finish().unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_transaction_replay() {
        let primary_dir = tempfile::tempdir().unwrap();
        let secondary_dir = tempfile::tempdir().unwrap();

        let storage: Arc<dyn Storage> = Arc::new(FileStore::open(primary_dir.path()).unwrap());
        let oid = storage.new_oid().unwrap();
        let tid = commit(storage.as_ref(), oid, b"hello");

        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();
        let replica: Arc<dyn Storage> =
            Arc::new(FileStore::open(secondary_dir.path()).unwrap());
        let secondary = Secondary::open(
            replica.clone(),
            primary.local_addr().to_string(),
            test_options(),
        );

        wait_until("the transaction to replicate", || {
            replica.last_transaction() == tid
        })
        .await;
        assert_eq!(secondary.last_transaction(), tid);
        assert_eq!(replica.load(oid).unwrap(), (b"hello".to_vec(), tid));

        // The replica's public face stays read-only
        let facade = secondary.storage();
        assert_eq!(facade.load(oid).unwrap(), (b"hello".to_vec(), tid));
        assert!(facade.new_oid().is_err());

        secondary.close().await.unwrap();
        primary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_live_commits_propagate() {
        let primary_dir = tempfile::tempdir().unwrap();
        let secondary_dir = tempfile::tempdir().unwrap();

        let storage: Arc<dyn Storage> = Arc::new(FileStore::open(primary_dir.path()).unwrap());
        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();
        let replica: Arc<dyn Storage> =
            Arc::new(FileStore::open(secondary_dir.path()).unwrap());
        let secondary = Secondary::open(
            replica.clone(),
            primary.local_addr().to_string(),
            test_options(),
        );

        // Commits go through the primary wrapper so producers are woken
        let oid = primary.new_oid().unwrap();
        let t1 = commit(primary.as_ref(), oid, b"one");
        wait_until("first commit", || replica.last_transaction() == t1).await;

        let t2 = commit(primary.as_ref(), oid, b"two");
        wait_until("second commit", || replica.last_transaction() == t2).await;
        assert_eq!(replica.load(oid).unwrap(), (b"two".to_vec(), t2));

        secondary.close().await.unwrap();
        primary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_catch_up_produces_identical_logs() {
        let primary_dir = tempfile::tempdir().unwrap();
        let secondary_dir = tempfile::tempdir().unwrap();

        let storage = Arc::new(FileStore::open(primary_dir.path()).unwrap());
        for i in 1..=5u64 {
            let oid = storage.new_oid().unwrap();
            commit(storage.as_ref(), oid, format!("payload-{i}").as_bytes());
        }
        let last = storage.last_transaction();
        let primary_log = storage.log_snapshot().path;

        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();
        let replica = Arc::new(FileStore::open(secondary_dir.path()).unwrap());
        let replica_log = replica.log_snapshot().path;
        let secondary = Secondary::open(
            replica.clone() as Arc<dyn Storage>,
            primary.local_addr().to_string(),
            test_options(),
        );

        wait_until("catch-up", || replica.last_transaction() == last).await;
        secondary.close().await.unwrap();
        primary.close().await.unwrap();

        // With no pack in between the two logs are byte-for-byte equal
        assert_eq!(
            std::fs::read(primary_log).unwrap(),
            std::fs::read(replica_log).unwrap()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_reconnect_at_current_tid_replays_nothing() {
        let primary_dir = tempfile::tempdir().unwrap();
        let secondary_dir = tempfile::tempdir().unwrap();

        let storage = Arc::new(FileStore::open(primary_dir.path()).unwrap());
        let oid = storage.new_oid().unwrap();
        let tid = commit(storage.as_ref(), oid, b"only");

        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();

        let replica = Arc::new(FileStore::open(secondary_dir.path()).unwrap());
        let secondary = Secondary::open(
            replica.clone() as Arc<dyn Storage>,
            primary.local_addr().to_string(),
            test_options(),
        );
        wait_until("catch-up", || replica.last_transaction() == tid).await;
        secondary.close().await.unwrap();

        // Reconnect with the store already caught up; the handshake TID
        // equals the primary's last and the stream stays quiet.
        let size_before = std::fs::metadata(secondary_dir.path().join("data.log"))
            .unwrap()
            .len();
        let replica = Arc::new(FileStore::open(secondary_dir.path()).unwrap());
        let secondary = Secondary::open(
            replica.clone() as Arc<dyn Storage>,
            primary.local_addr().to_string(),
            test_options(),
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(replica.last_transaction(), tid);
        assert_eq!(
            std::fs::metadata(secondary_dir.path().join("data.log"))
                .unwrap()
                .len(),
            size_before
        );

        secondary.close().await.unwrap();
        primary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blob_streaming() {
        let primary_dir = tempfile::tempdir().unwrap();
        let secondary_dir = tempfile::tempdir().unwrap();

        let storage = Arc::new(FileStore::open_with_blobs(primary_dir.path()).unwrap());
        let oid = storage.new_oid().unwrap();
        let tid = {
            let blob_data: Vec<u8> = (0..132_000u32).map(|i| (i % 251) as u8).collect();
            let blobs = storage.blobs().unwrap();
            let spool = blobs.temporary_directory().join("outgoing.blob");
            std::fs::write(&spool, &blob_data).unwrap();

            let meta = TransactionMeta::new(Tid::ZERO, TxnStatus::Normal);
            storage.tpc_begin(&meta).unwrap();
            let mut marker = BLOB_MARKER.to_vec();
            marker.extend_from_slice(b"132000");
            blobs.store_blob(oid, &marker, &spool).unwrap();
            storage.tpc_vote().unwrap();
            storage.tpc_finish().unwrap()
        };

        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();
        let replica = Arc::new(FileStore::open_with_blobs(secondary_dir.path()).unwrap());
        let secondary = Secondary::open(
            replica.clone() as Arc<dyn Storage>,
            primary.local_addr().to_string(),
            test_options(),
        );

        wait_until("blob transaction", || replica.last_transaction() == tid).await;
        let blob_path = replica.blobs().unwrap().load_blob(oid, tid).unwrap();
        let received = std::fs::read(blob_path).unwrap();
        assert_eq!(received.len(), 132_000);
        assert_eq!(received[0], 0);
        assert_eq!(received[received.len() - 1], (131_999u32 % 251) as u8);

        secondary.close().await.unwrap();
        primary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tid_too_high_drops_the_connection() {
        let primary_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStore::open(primary_dir.path()).unwrap());
        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();

        // Empty primary, but the client claims to have seen transaction 1
        let mut socket = TcpStream::connect(primary.local_addr()).await.unwrap();
        socket.write_all(&marshal(b"zrs2.1")).await.unwrap();
        socket
            .write_all(&marshal(Tid::from_u64(1).as_bytes()))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(10), socket.read(&mut buf))
            .await
            .expect("server must drop the connection")
            .unwrap();
        assert_eq!(n, 0, "no data, just a close");

        primary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bad_protocol_tag_rejected() {
        let primary_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> = Arc::new(FileStore::open(primary_dir.path()).unwrap());
        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();

        let mut socket = TcpStream::connect(primary.local_addr()).await.unwrap();
        socket.write_all(&marshal(b"zrs1.9")).await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(10), socket.read(&mut buf))
            .await
            .expect("server must drop the connection")
            .unwrap();
        assert_eq!(n, 0);

        primary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_legacy_tag_rejected_on_blob_primary() {
        let primary_dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn Storage> =
            Arc::new(FileStore::open_with_blobs(primary_dir.path()).unwrap());
        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();

        let mut socket = TcpStream::connect(primary.local_addr()).await.unwrap();
        socket.write_all(&marshal(b"zrs2.0")).await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(10), socket.read(&mut buf))
            .await
            .expect("server must drop the connection")
            .unwrap();
        assert_eq!(n, 0);

        primary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_secondary_sends_keepalives() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let secondary_dir = tempfile::tempdir().unwrap();
        let replica = Arc::new(FileStore::open(secondary_dir.path()).unwrap());
        let secondary = Secondary::open(
            replica as Arc<dyn Storage>,
            addr.to_string(),
            SecondaryOptions {
                keep_alive_delay: Duration::from_millis(200),
                ..test_options()
            },
        );

        let (mut socket, _) = timeout(Duration::from_secs(10), listener.accept())
            .await
            .unwrap()
            .unwrap();

        // Handshake (tag + tid), then empty keepalive frames
        let mut stream = FrameStream::new();
        let mut messages = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while messages.len() < 3 {
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for keepalive");
            }
            let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            messages.extend(stream.push(&buf[..n]).unwrap());
        }
        assert_eq!(messages[0], b"zrs2.0");
        assert_eq!(messages[1], Tid::ZERO.as_bytes());
        assert!(messages[2].is_empty(), "keepalive is an empty frame");

        secondary.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cascaded_replication() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let c_dir = tempfile::tempdir().unwrap();

        // A (writable primary) -> B (cascade) -> C (leaf secondary)
        let a_store: Arc<dyn Storage> = Arc::new(FileStore::open(a_dir.path()).unwrap());
        let a = Primary::open(a_store, "127.0.0.1:0").await.unwrap();

        let b_store: Arc<dyn Storage> = Arc::new(FileStore::open(b_dir.path()).unwrap());
        let b_primary = Primary::open(b_store, "127.0.0.1:0").await.unwrap();
        let b_secondary = Secondary::open(
            b_primary.clone() as Arc<dyn Storage>,
            a.local_addr().to_string(),
            test_options(),
        );

        let c_store = Arc::new(FileStore::open(c_dir.path()).unwrap());
        let c = Secondary::open(
            c_store.clone() as Arc<dyn Storage>,
            b_primary.local_addr().to_string(),
            test_options(),
        );

        let oid = a.new_oid().unwrap();
        let tid = commit(a.as_ref(), oid, b"rippled");
        wait_until("commit to reach the leaf", || {
            c_store.last_transaction() == tid
        })
        .await;
        assert_eq!(c_store.load(oid).unwrap(), (b"rippled".to_vec(), tid));

        c.close().await.unwrap();
        b_secondary.close().await.unwrap();
        b_primary.close().await.unwrap();
        a.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_graceful_close_drains_producers() {
        let primary_dir = tempfile::tempdir().unwrap();
        let secondary_dir = tempfile::tempdir().unwrap();

        let storage = Arc::new(FileStore::open(primary_dir.path()).unwrap());
        let mut last = Tid::ZERO;
        for i in 1..=3u64 {
            let oid = storage.new_oid().unwrap();
            last = commit(storage.as_ref(), oid, format!("drain-{i}").as_bytes());
        }

        let primary = Primary::open(storage, "127.0.0.1:0").await.unwrap();
        let replica = Arc::new(FileStore::open(secondary_dir.path()).unwrap());
        let secondary = Secondary::open(
            replica.clone() as Arc<dyn Storage>,
            primary.local_addr().to_string(),
            test_options(),
        );

        // Close the primary as soon as the secondary is connected; the
        // producer catches up before the connection is dropped.
        wait_until("secondary to catch up", || {
            replica.last_transaction() == last
        })
        .await;
        primary.close().await.unwrap();
        secondary.close().await.unwrap();
        assert_eq!(replica.last_transaction(), last);
    }
}
