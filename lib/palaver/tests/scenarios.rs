//! End-to-end scenarios driving a live server over a real socket.

use palaver::config::ServerConfig;
use palaver::logging::{o, Discard, Logger};
use palaver::net::codec;
use palaver::net::frame::{Message, MessageData, Nickname, Op, NAME_SIZE};
use palaver::server::{Server, ServerCtx, ServerHandle};
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

struct TestServer {
    config: ServerConfig,
    ctx: Arc<ServerCtx>,
    handle: ServerHandle,
    thread: Option<JoinHandle<io::Result<()>>>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn start<F: FnOnce(&mut ServerConfig)>(tweak: F) -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            unix_path: dir.path().join("palaver.sock"),
            dir_name: dir.path().join("store"),
            stat_file_name: dir.path().join("stats.txt"),
            max_connections: 16,
            threads_in_pool: 4,
            max_msg_size: 512,
            max_file_size: 4,
            max_hist_msgs: 8,
        };
        tweak(&mut config);

        let log = Logger::root(Discard, o!());
        let server = Server::bind(config.clone(), &log).unwrap();
        let ctx = server.ctx();
        let handle = server.handle();
        let thread = thread::spawn(move || server.run());

        TestServer {
            config,
            ctx,
            handle,
            thread: Some(thread),
            _dir: dir,
        }
    }

    fn client(&self) -> UnixStream {
        let stream = UnixStream::connect(&self.config.unix_path).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn stop(mut self) {
        self.handle.shutdown();
        self.thread.take().unwrap().join().unwrap().unwrap();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

fn send(stream: &mut UnixStream, op: Op, sender: &str, receiver: &str, payload: &[u8]) {
    let msg = Message::new(
        op,
        Nickname::new(sender),
        Nickname::new(receiver),
        payload.to_vec(),
    );
    codec::send_msg(stream, &msg).unwrap();
}

fn recv_ack(stream: &mut UnixStream) -> u8 {
    codec::read_header(stream).unwrap().op
}

fn recv_msg(stream: &mut UnixStream) -> Message {
    codec::read_msg(stream).unwrap()
}

/// Registers a nickname and returns the OK reply with the online snapshot.
fn register(stream: &mut UnixStream, name: &str) -> Message {
    send(stream, Op::Register, name, "", b"");
    let reply = recv_msg(stream);
    assert_eq!(reply.hdr.op, u8::from(Op::Ok), "registration of {} failed", name);
    reply
}

/// Decodes a packed users-online snapshot into nickname strings.
fn snapshot_names(buf: &[u8]) -> Vec<String> {
    assert_eq!(buf.len() % NAME_SIZE, 0);
    buf.chunks(NAME_SIZE)
        .map(|chunk| {
            let mut raw = [0u8; NAME_SIZE];
            raw.copy_from_slice(chunk);
            Nickname::from_wire(raw).to_string()
        })
        .collect()
}

#[test]
fn test_register_and_list() {
    let server = TestServer::start(|_| {});
    let mut alice = server.client();

    let reply = register(&mut alice, "alice");
    assert_eq!(snapshot_names(&reply.data.buf), ["alice"]);

    let counters = server.ctx.stats.snapshot();
    assert_eq!(counters.nusers, 1);
    assert_eq!(counters.nonline, 1);

    server.stop();
}

#[test]
fn test_duplicate_register() {
    let server = TestServer::start(|_| {});
    let mut alice = server.client();

    register(&mut alice, "alice");

    send(&mut alice, Op::Register, "alice", "", b"");
    assert_eq!(recv_ack(&mut alice), u8::from(Op::NickAlready));

    let counters = server.ctx.stats.snapshot();
    assert_eq!(counters.nusers, 1);
    assert_eq!(counters.nonline, 1);
    assert_eq!(counters.nerrors, 1);

    server.stop();
}

#[test]
fn test_point_to_point_text() {
    let server = TestServer::start(|_| {});
    let mut alice = server.client();
    let mut bob = server.client();

    register(&mut alice, "alice");
    register(&mut bob, "bob");

    send(&mut alice, Op::PostTxt, "alice", "bob", b"hi");

    let pushed = recv_msg(&mut bob);
    assert_eq!(pushed.hdr.op, u8::from(Op::TxtMessage));
    assert_eq!(pushed.hdr.sender, Nickname::new("alice"));
    assert_eq!(pushed.data.buf, b"hi");

    assert_eq!(recv_ack(&mut alice), u8::from(Op::Ok));

    let history = server.ctx.directory.history_of(&Nickname::new("bob")).unwrap();
    assert_eq!(history.len(), 1);

    server.stop();
}

#[test]
fn test_history_overflow_and_fetch() {
    let server = TestServer::start(|config| config.max_hist_msgs = 2);
    let mut alice = server.client();

    register(&mut alice, "alice");

    {
        let mut bob = server.client();
        register(&mut bob, "bob");
        send(&mut bob, Op::Disconnect, "bob", "", b"");
        assert_eq!(recv_ack(&mut bob), u8::from(Op::Ok));
    }

    for payload in &[b"a", b"b", b"c"] {
        send(&mut alice, Op::PostTxt, "alice", "bob", *payload);
        assert_eq!(recv_ack(&mut alice), u8::from(Op::Ok));
    }

    let mut bob = server.client();
    send(&mut bob, Op::Connect, "bob", "", b"");
    assert_eq!(recv_msg(&mut bob).hdr.op, u8::from(Op::Ok));

    send(&mut bob, Op::GetPrevMsgs, "bob", "", b"");
    let count = recv_msg(&mut bob);
    assert_eq!(count.hdr.op, u8::from(Op::Ok));
    assert_eq!(count.data.buf, 2u32.to_le_bytes());

    let first = recv_msg(&mut bob);
    assert_eq!(first.hdr.op, u8::from(Op::TxtMessage));
    assert_eq!(first.data.buf, b"b");

    let second = recv_msg(&mut bob);
    assert_eq!(second.data.buf, b"c");

    server.stop();
}

#[test]
fn test_file_too_large() {
    let server = TestServer::start(|config| config.max_file_size = 1);
    let mut alice = server.client();
    let mut bob = server.client();

    register(&mut alice, "alice");
    register(&mut bob, "bob");

    send(&mut alice, Op::PostFile, "alice", "bob", b"blob.bin");
    codec::send_data(
        &mut alice,
        &MessageData {
            receiver: Nickname::EMPTY,
            buf: vec![0; 2049],
        },
    )
    .unwrap();

    assert_eq!(recv_ack(&mut alice), u8::from(Op::MsgTooLong));
    assert!(!server.config.dir_name.join("blob.bin").exists());

    server.stop();
}

#[test]
fn test_file_store_and_fetch() {
    let server = TestServer::start(|_| {});
    let mut alice = server.client();
    let mut bob = server.client();

    register(&mut alice, "alice");
    register(&mut bob, "bob");

    let content: Vec<u8> = (0..200u8).collect();
    send(&mut alice, Op::PostFile, "alice", "bob", b"./notes.txt");
    codec::send_data(
        &mut alice,
        &MessageData {
            receiver: Nickname::EMPTY,
            buf: content.clone(),
        },
    )
    .unwrap();

    let notice = recv_msg(&mut bob);
    assert_eq!(notice.hdr.op, u8::from(Op::FileMessage));
    assert_eq!(notice.data.buf, b"./notes.txt");

    assert_eq!(recv_ack(&mut alice), u8::from(Op::Ok));
    assert!(server.config.dir_name.join("notes.txt").exists());

    send(&mut bob, Op::GetFile, "bob", "", b"notes.txt");
    let file = recv_msg(&mut bob);
    assert_eq!(file.hdr.op, u8::from(Op::Ok));
    assert_eq!(file.data.buf, content);

    server.stop();
}

#[test]
fn test_broadcast_excludes_sender() {
    let server = TestServer::start(|_| {});
    let mut a = server.client();
    let mut b = server.client();
    let mut c = server.client();

    register(&mut a, "a");
    register(&mut b, "b");
    register(&mut c, "c");

    send(&mut a, Op::PostTxtAll, "a", "", b"yo");
    assert_eq!(recv_ack(&mut a), u8::from(Op::Ok));

    for peer in vec![&mut b, &mut c] {
        let pushed = recv_msg(peer);
        assert_eq!(pushed.hdr.op, u8::from(Op::TxtMessage));
        assert_eq!(pushed.hdr.sender, Nickname::new("a"));
        assert_eq!(pushed.data.buf, b"yo");
    }

    let directory = &server.ctx.directory;
    assert_eq!(directory.history_of(&Nickname::new("a")).unwrap().len(), 0);
    assert_eq!(directory.history_of(&Nickname::new("b")).unwrap().len(), 1);
    assert_eq!(directory.history_of(&Nickname::new("c")).unwrap().len(), 1);

    server.stop();
}

#[test]
fn test_connection_cap() {
    let server = TestServer::start(|config| config.max_connections = 1);
    let mut solo = server.client();

    register(&mut solo, "solo");

    let mut rejected = server.client();
    assert_eq!(recv_ack(&mut rejected), u8::from(Op::Fail));
    assert_eq!(
        codec::read_header(&mut rejected).unwrap_err(),
        codec::NetError::Closed
    );

    // The first client is unaffected.
    send(&mut solo, Op::UsrList, "solo", "", b"");
    let reply = recv_msg(&mut solo);
    assert_eq!(reply.hdr.op, u8::from(Op::Ok));
    assert_eq!(snapshot_names(&reply.data.buf), ["solo"]);

    assert!(server.ctx.stats.snapshot().nerrors >= 1);

    server.stop();
}

#[test]
fn test_fifo_per_descriptor() {
    let server = TestServer::start(|_| {});
    let mut alice = server.client();

    register(&mut alice, "alice");

    // Two requests back to back; each reply must arrive complete and in
    // request order.
    send(&mut alice, Op::UsrList, "alice", "", b"");
    send(&mut alice, Op::UsrList, "alice", "", b"");

    for _ in 0..2 {
        let reply = recv_msg(&mut alice);
        assert_eq!(reply.hdr.op, u8::from(Op::Ok));
        assert_eq!(snapshot_names(&reply.data.buf), ["alice"]);
    }

    server.stop();
}

#[test]
fn test_unregister_lifecycle() {
    let server = TestServer::start(|_| {});
    let mut alice = server.client();

    register(&mut alice, "alice");

    send(&mut alice, Op::Unregister, "alice", "", b"");
    assert_eq!(recv_ack(&mut alice), u8::from(Op::Ok));

    let counters = server.ctx.stats.snapshot();
    assert_eq!(counters.nusers, 0);
    assert_eq!(counters.nonline, 0);
    assert_eq!(server.ctx.directory.registered_count(), 0);

    server.stop();
}

#[test]
fn test_concurrent_senders() {
    use rand::Rng;

    let server = TestServer::start(|config| config.max_hist_msgs = 100);

    {
        let mut sink = server.client();
        register(&mut sink, "sink");
        send(&mut sink, Op::Disconnect, "sink", "", b"");
        assert_eq!(recv_ack(&mut sink), u8::from(Op::Ok));
    }

    let senders: Vec<_> = (0..4)
        .map(|id| {
            let path = server.config.unix_path.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                let mut client = UnixStream::connect(&path).unwrap();
                client
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .unwrap();

                for _ in 0..20 {
                    let len = rng.gen_range(1..=64);
                    let payload: Vec<u8> = (0..len).map(|_| rng.gen::<u8>()).collect();
                    let msg = Message::new(
                        Op::PostTxt,
                        Nickname::new(&format!("sender{}", id)),
                        Nickname::new("sink"),
                        payload,
                    );
                    codec::send_msg(&mut client, &msg).unwrap();
                    assert_eq!(
                        codec::read_header(&mut client).unwrap().op,
                        u8::from(Op::Ok)
                    );
                }
            })
        })
        .collect();

    for sender in senders {
        sender.join().unwrap();
    }

    let mut sink = server.client();
    send(&mut sink, Op::Connect, "sink", "", b"");
    assert_eq!(recv_msg(&mut sink).hdr.op, u8::from(Op::Ok));

    send(&mut sink, Op::GetPrevMsgs, "sink", "", b"");
    let count = recv_msg(&mut sink);
    assert_eq!(count.data.buf, 80u32.to_le_bytes());

    for _ in 0..80 {
        let parked = recv_msg(&mut sink);
        assert_eq!(parked.hdr.op, u8::from(Op::TxtMessage));
        assert!(!parked.data.buf.is_empty());
    }

    server.stop();
}

#[test]
fn test_shutdown_liveness() {
    let server = TestServer::start(|config| config.threads_in_pool = 8);
    let mut alice = server.client();

    register(&mut alice, "alice");

    // Joins the main loop, the signal thread and every worker; a hang here
    // fails the test harness.
    server.stop();
}
