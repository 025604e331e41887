//! Cross-process contention test: two processes publish to one topic while a
//! subscriber in the parent takes, verifying no message is ever torn.
//!
//! The child process is this same test binary re-invoked with env var flags.
//! A pair of marker files sequences teardown so the parent has attached the
//! child's allocator before the child exits and unlinks it.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hazcat_core::{Allocator, Context};

const CHILD_ENV: &str = "HAZCAT_IPC_CHILD";
const TOPIC_ENV: &str = "HAZCAT_IPC_TOPIC";
const DONE_ENV: &str = "HAZCAT_IPC_DONE";
const ACK_ENV: &str = "HAZCAT_IPC_ACK";

const MSGS: u64 = 200;
const WORDS: usize = 8;
const ITEM_SIZE: usize = WORDS * 8;
const DEPTH: usize = 64;

const CHILD_TAG: u64 = 1 << 48;
const PARENT_TAG: u64 = 2 << 48;

fn payload_for(v: u64) -> Vec<u8> {
    std::iter::repeat(v.to_le_bytes()).take(WORDS).flatten().collect()
}

/// Child role: flood the topic, then hold the allocator alive until the
/// parent acknowledges it has drained.
fn child_publisher() {
    let topic = std::env::var(TOPIC_ENV).expect("HAZCAT_IPC_TOPIC not set");
    let done = PathBuf::from(std::env::var(DONE_ENV).expect("HAZCAT_IPC_DONE not set"));
    let ack = PathBuf::from(std::env::var(ACK_ENV).expect("HAZCAT_IPC_ACK not set"));

    let ctx = Context::new().expect("child: context");
    let pool = Allocator::cpu_ring(ITEM_SIZE, 512).expect("child: allocator");
    let publisher = ctx
        .register_publisher(&topic, pool, DEPTH)
        .expect("child: register");

    for k in 0..MSGS {
        publisher
            .publish_bytes(&payload_for(CHILD_TAG | k))
            .expect("child: publish");
        if k % 16 == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    std::fs::write(&done, b"done").expect("child: done marker");

    // Keep our allocator mapped until the parent is done taking from it
    let deadline = Instant::now() + Duration::from_secs(20);
    while !ack.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn check_payload(bytes: &[u8]) -> u64 {
    assert_eq!(bytes.len(), ITEM_SIZE);
    let words: Vec<u64> = bytes
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert!(
        words.iter().all(|w| *w == words[0]),
        "torn payload: {words:?}"
    );
    let v = words[0];
    let tag = v & (CHILD_TAG | PARENT_TAG);
    assert!(tag == CHILD_TAG || tag == PARENT_TAG, "unknown producer: {v:#x}");
    assert!(v & 0xFFFF_FFFF < MSGS, "out-of-range sequence: {v:#x}");
    v
}

#[test]
fn contended_publishers_deliver_untorn_messages() {
    if std::env::var(CHILD_ENV).is_ok() {
        child_publisher();
        return;
    }
    let _ = env_logger::builder().is_test(true).try_init();

    let stamp = format!(
        "{}_{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    );
    let topic = format!("/ipc/contended_{stamp}");
    let done = std::env::temp_dir().join(format!("hazcat_done_{stamp}"));
    let ack = std::env::temp_dir().join(format!("hazcat_ack_{stamp}"));

    let ctx = Context::new().unwrap();
    let sub_pool = Allocator::cpu_ring(ITEM_SIZE, 128).unwrap();
    let mut subscriber = ctx
        .register_subscription(&topic, sub_pool, DEPTH)
        .unwrap();

    let pub_pool = Allocator::cpu_ring(ITEM_SIZE, 512).unwrap();
    let publisher = ctx
        .register_publisher(&topic, Arc::clone(&pub_pool), DEPTH)
        .unwrap();

    let exe = std::env::current_exe().unwrap();
    let mut child = Command::new(exe)
        .args([
            "contended_publishers_deliver_untorn_messages",
            "--exact",
            "--nocapture",
        ])
        .env(CHILD_ENV, "1")
        .env(TOPIC_ENV, &topic)
        .env(DONE_ENV, &done)
        .env(ACK_ENV, &ack)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    let mut child_msgs = 0usize;
    let mut parent_msgs = 0usize;
    let mut observe = |v: u64| {
        if v & CHILD_TAG != 0 {
            child_msgs += 1;
        } else {
            parent_msgs += 1;
        }
    };

    // Publish our own stream while draining whatever both producers wrote
    for k in 0..MSGS {
        publisher.publish_bytes(&payload_for(PARENT_TAG | k)).unwrap();
        for _ in 0..4 {
            match subscriber.take().unwrap() {
                Some(msg) => observe(check_payload(msg.as_slice().unwrap())),
                None => break,
            }
        }
        if k % 16 == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // Keep draining until the child reports completion, then empty the queue
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        while let Some(msg) = subscriber.take().unwrap() {
            observe(check_payload(msg.as_slice().unwrap()));
        }
        if done.exists() {
            break;
        }
        assert!(Instant::now() < deadline, "child never finished publishing");
        std::thread::sleep(Duration::from_millis(2));
    }
    while let Some(msg) = subscriber.take().unwrap() {
        observe(check_payload(msg.as_slice().unwrap()));
    }

    std::fs::write(&ack, b"ack").unwrap();
    let status = child.wait().unwrap();
    assert!(status.success(), "child test process failed");

    assert!(parent_msgs > 0, "subscriber saw the local publisher");
    assert!(child_msgs > 0, "subscriber saw the remote publisher");

    let _ = std::fs::remove_file(&done);
    let _ = std::fs::remove_file(&ack);
}
