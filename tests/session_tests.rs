mod common;

use audio_plugin_rs::host::HostEvent;
use common::{file_len, fixture, test_settings, wait_until, Fixture, ServerConn};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

#[test_log::test(tokio::test)]
async fn authenticates_and_acknowledges_empty_lines() {
    let Fixture {
        session,
        listener,
        save_dir: _save_dir,
        ..
    } = fixture(test_settings()).await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        // A malformed command produces no reply, the blank line does
        conn.send(b"6\tabc\n\n").await;
        assert_eq!(conn.read_line().await, "\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
}

#[test_log::test(tokio::test)]
async fn commands_split_across_reads_are_reassembled() {
    let Fixture {
        session,
        listener,
        save_dir: _save_dir,
        ..
    } = fixture(test_settings()).await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(b"10\t5").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.send(b"\t3\n").await;
        assert_eq!(conn.read_line().await, "7\t5\t3\t0\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
}

#[test_log::test(tokio::test)]
async fn upload_is_received_then_commands_resume() {
    let Fixture {
        session,
        listener,
        recorder,
        save_dir,
        ..
    } = fixture(test_settings()).await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(b"0\tpack\n3\t1\t7\tsong.mp3\t5\t0\n").await;
        assert_eq!(conn.read_line().await, "1\t0\n");

        // File bytes directly followed by the next command in one write
        conn.send(b"hello10\t1\t99\n").await;
        assert_eq!(conn.read_line().await, "7\t1\t99\t0\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);

    let path = save_dir.path().join("audiopacks").join("pack").join("song.mp3");
    assert_eq!(std::fs::read(path).unwrap(), b"hello");
    assert!(recorder.has_call("register 7 song.mp3"));
}

#[test_log::test(tokio::test)]
async fn disabled_transfers_reply_error() {
    let Fixture {
        session,
        listener,
        save_dir: _save_dir,
        ..
    } = fixture(audio_plugin_rs::config::Settings {
        transfer_files: false,
        ..test_settings()
    })
    .await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(b"0\tpack\n3\t1\t7\tsong.mp3\t120\tA1B2C3D4\n").await;
        assert_eq!(conn.read_line().await, "1\t3\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
}

#[test_log::test(tokio::test)]
async fn matching_local_file_short_circuits_with_check() {
    let Fixture {
        session,
        listener,
        recorder,
        save_dir,
        ..
    } = fixture(test_settings()).await;
    let pack = save_dir.path().join("audiopacks").join("pack");
    std::fs::create_dir_all(&pack).unwrap();
    std::fs::write(pack.join("song.mp3"), b"cached audio").unwrap();
    let command = format!(
        "0\tpack\n3\t1\t7\tsong.mp3\t12\t{:08X}\n",
        crc32fast::hash(b"cached audio")
    );
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(command.as_bytes()).await;
        assert_eq!(conn.read_line().await, "1\t2\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
    assert!(recorder.has_call("register 7 song.mp3"));
}

#[test_log::test(tokio::test)]
async fn truncated_upload_reports_error_and_discards_file() {
    let Fixture {
        session,
        listener,
        recorder,
        save_dir,
        ..
    } = fixture(test_settings()).await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(b"0\tpack\n3\t1\t7\tsong.mp3\t10\t0\n").await;
        assert_eq!(conn.read_line().await, "1\t0\n");

        conn.send(b"abc").await;
        conn.writer.shutdown().await.unwrap();
        assert_eq!(conn.read_line().await, "1\t3\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);

    let path = save_dir.path().join("audiopacks").join("pack").join("song.mp3");
    assert!(!path.exists());
    assert!(!recorder.has_call("register 7 song.mp3"));
    assert!(recorder.has_call("free_all"));
}

#[test_log::test(tokio::test)]
async fn remote_transfer_downloads_and_replies_remote() {
    let Fixture {
        session,
        listener,
        recorder,
        save_dir,
        ..
    } = fixture(test_settings()).await;
    let url = ServerConn::http_file("packs/intro.ogg", b"OggS").await;
    let command = format!("0\tpack\n3\t1\t3\t{url}\t4\t0\n");
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(command.as_bytes()).await;
        assert_eq!(conn.read_line().await, "1\t1\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);

    let path = save_dir.path().join("audiopacks").join("pack").join("intro.ogg");
    assert_eq!(std::fs::read(path).unwrap(), b"OggS");
    assert!(recorder.has_call("register 3 intro.ogg"));
}

#[test_log::test(tokio::test)]
async fn dropped_connection_discards_partial_download() {
    let Fixture {
        session,
        listener,
        save_dir,
        ..
    } = fixture(test_settings()).await;
    let url = ServerConn::http_stalled_file("packs/intro.ogg", 1000, b"OggS-pa").await;
    let command = format!("0\tpack\n3\t1\t3\t{url}\t1000\t0\n");
    let path = save_dir.path().join("audiopacks").join("pack").join("intro.ogg");
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(command.as_bytes()).await;
        wait_until(|| file_len(&path) == Some(7)).await;
        drop(conn);

        let _second = ServerConn::accept_authenticated(&listener).await;
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
    assert!(!path.exists());
}

#[test_log::test(tokio::test)]
async fn host_events_are_forwarded() {
    let Fixture {
        session,
        listener,
        host_events,
        save_dir: _save_dir,
        ..
    } = fixture(test_settings()).await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        host_events
            .send(HostEvent::RadioStationChanged { station: 2 })
            .unwrap();
        assert_eq!(conn.read_line().await, "5\t2\n");

        conn.send(b"4\t7\t11\t0\t0\t0\n").await;
        assert_eq!(conn.read_line().await, "2\t11\t0\n");

        // Only streams the client started are reported
        host_events
            .send(HostEvent::StreamStopped { handle: 999 })
            .unwrap();
        host_events
            .send(HostEvent::StreamStopped { handle: 11 })
            .unwrap();
        assert_eq!(conn.read_line().await, "4\t11\n");
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
}

#[test_log::test(tokio::test)]
async fn idle_connection_is_dropped_and_reestablished() {
    let Fixture {
        session,
        listener,
        recorder,
        save_dir: _save_dir,
        ..
    } = fixture(audio_plugin_rs::config::Settings {
        network_timeout_ms: 200,
        ..test_settings()
    })
    .await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut first = ServerConn::accept_authenticated(&listener).await;
        // Say nothing; the client gives up and closes the socket
        assert_eq!(first.read_line().await, "");

        let _second = ServerConn::accept_authenticated(&listener).await;
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
    assert!(recorder.has_call("free_all"));
}

#[test_log::test(tokio::test)]
async fn waits_for_game_session_before_connecting() {
    let Fixture {
        session,
        listener,
        recorder,
        save_dir: _save_dir,
        ..
    } = fixture(test_settings()).await;
    recorder.set_ready(false);
    let shutdown = CancellationToken::new();

    let server = async {
        let early = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(early.is_err(), "connected before the game was ready");

        recorder.set_ready(true);
        let _conn = ServerConn::accept_authenticated(&listener).await;
        shutdown.cancel();
    };

    tokio::join!(session.run(shutdown.clone()), server);
}

#[test_log::test(tokio::test)]
async fn shutdown_flushes_queued_replies() {
    let Fixture {
        session,
        listener,
        save_dir: _save_dir,
        ..
    } = fixture(test_settings()).await;
    let shutdown = CancellationToken::new();

    let server = async {
        let mut conn = ServerConn::accept_authenticated(&listener).await;
        conn.send(b"\n").await;
        assert_eq!(conn.read_line().await, "\n");
        shutdown.cancel();
        // The client closes its side once the queue is drained
        assert_eq!(conn.read_line().await, "");
    };

    tokio::join!(session.run(shutdown.clone()), server);
}
