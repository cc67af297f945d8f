//! End-to-end poll cycles against a scripted modem and an in-memory sink.
//!
//! The invariant under test throughout: a storage slot is deleted if and only
//! if every destination received the message it belonged to.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use smsgate_core::MultipartCollector;
use smsgate_daemon::config::Config;
use smsgate_daemon::pipeline::{process_messages, CycleError};
use smsgate_daemon::telegram::{MessageSink, SinkError};
use smsgate_modem::AtTransport;

/// "Hello" from +1234567890, single part.
const HELLO_PDU: &str = "00040A91214365870900004221115103542105C8329BFD06";
/// Parts 1..3 of a 3-part message (reference 42): "A", "B", "C".
const PART_A: &str = "00440A912143658709000042211151035421080500032A030182";
const PART_B: &str = "00440A912143658709000042211151035421080500032A030284";
const PART_C: &str = "00440A912143658709000042211151035421080500032A030386";

// ----------------------------------------------------------------------------
// Test Doubles
// ----------------------------------------------------------------------------

/// Records deliveries; optionally fails the first N send calls.
#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(i64, String)>>,
    calls: Mutex<u32>,
    failures_remaining: Mutex<u32>,
}

impl RecordingSink {
    fn failing(times: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(times),
            ..Self::default()
        }
    }

    fn call_count(&self) -> u32 {
        *self.calls.lock().unwrap()
    }

    fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn send(&self, chat_id: i64, text: &str) -> Result<(), SinkError> {
        *self.calls.lock().unwrap() += 1;
        {
            let mut failures = self.failures_remaining.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::Api {
                    description: "simulated failure".to_string(),
                });
            }
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}

/// Far end of the serial pipe: answers commands and records them.
fn spawn_modem(
    mut port: DuplexStream,
    commands: Arc<Mutex<Vec<String>>>,
    mut respond: impl FnMut(&str) -> Vec<String> + Send + 'static,
) {
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = match port.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buffer.extend_from_slice(&chunk[..n]);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let command = String::from_utf8_lossy(&raw).trim().to_string();
                if command.is_empty() {
                    continue;
                }
                commands.lock().unwrap().push(command.clone());
                let mut reply = String::new();
                for line in respond(&command) {
                    reply.push_str(&line);
                    reply.push_str("\r\n");
                }
                if port.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    });
}

/// `AT+CMGL=4` response listing the given (index, pdu) pairs.
fn cmgl_response(entries: &[(u32, &str)]) -> Vec<String> {
    let mut lines = Vec::new();
    for (index, pdu) in entries {
        lines.push(format!("+CMGL: {index},0,,{}", pdu.len() / 2));
        lines.push((*pdu).to_string());
    }
    lines.push("OK".to_string());
    lines
}

fn test_config(chat_ids: Vec<i64>) -> Config {
    Config {
        telegram_token: "123:token".to_string(),
        chat_ids,
        serial_port: "/dev/null".to_string(),
        baud_rate: 115_200,
        log_level: "info".to_string(),
        dry_run: false,
        multipart_max_age_secs: 0,
        telegram_send_timeout_secs: 20,
        network_reg_grace_secs: 90,
        poll_interval_secs: 10,
        health_check_interval_secs: 60,
    }
}

fn deletions(commands: &[String]) -> Vec<String> {
    commands
        .iter()
        .filter(|c| c.starts_with("AT+CMGD="))
        .cloned()
        .collect()
}

struct Harness {
    at: AtTransport<DuplexStream>,
    collector: MultipartCollector,
    commands: Arc<Mutex<Vec<String>>>,
    cancel: CancellationToken,
}

fn harness(respond: impl FnMut(&str) -> Vec<String> + Send + 'static) -> Harness {
    let (local, remote) = duplex(8192);
    let commands = Arc::new(Mutex::new(Vec::new()));
    spawn_modem(remote, commands.clone(), respond);
    Harness {
        at: AtTransport::new(local, Duration::from_millis(500)),
        collector: MultipartCollector::new(),
        commands,
        cancel: CancellationToken::new(),
    }
}

// ----------------------------------------------------------------------------
// Cycles
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_forward_then_delete_single_message() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(3, HELLO_PDU)])
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let config = test_config(vec![100, 200]);

    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    let sent = sink.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].0, 100);
    assert_eq!(sent[1].0, 200);
    assert!(sent[0].1.contains("Hello"));
    assert!(sent[0].1.contains("+1234567890"));

    assert_eq!(deletions(&h.commands.lock().unwrap()), vec!["AT+CMGD=3"]);
}

#[tokio::test(start_paused = true)]
async fn test_multipart_assembles_out_of_order_and_deletes_all_parts() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            // arrival order 2, 1, 3
            cmgl_response(&[(12, PART_B), (11, PART_A), (13, PART_C)])
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let config = test_config(vec![100]);

    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("ABC"));
    assert!(sent[0].1.contains("<b>Parts:</b> 3"));

    let mut deleted = deletions(&h.commands.lock().unwrap());
    deleted.sort();
    assert_eq!(deleted, vec!["AT+CMGD=11", "AT+CMGD=12", "AT+CMGD=13"]);
    assert_eq!(h.collector.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sink_failure_blocks_all_deletion() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(1, HELLO_PDU), (2, HELLO_PDU)])
        } else {
            vec!["OK".to_string()]
        }
    });
    // every attempt fails, for every destination
    let sink = RecordingSink::failing(u32::MAX);
    let config = test_config(vec![100, 200]);

    let err = process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, CycleError::Delivery(_)));

    // ten attempts against the first chat, the second never tried
    assert_eq!(sink.call_count(), 10);
    assert!(sink.sent().is_empty());
    assert!(deletions(&h.commands.lock().unwrap()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_sink_failures_retry_until_delivered() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(5, HELLO_PDU)])
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::failing(3);
    let config = test_config(vec![100]);

    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    assert_eq!(sink.call_count(), 4);
    assert_eq!(sink.sent().len(), 1);
    assert_eq!(deletions(&h.commands.lock().unwrap()), vec!["AT+CMGD=5"]);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_pdu_is_forwarded_as_placeholder_and_deleted() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(8, "NOT-A-PDU")])
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let config = test_config(vec![100]);

    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    let sent = sink.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("PDU parse error"));
    assert!(sent[0].1.contains("NOT-A-PDU"));
    assert!(sent[0].1.contains("unknown"));

    assert_eq!(deletions(&h.commands.lock().unwrap()), vec!["AT+CMGD=8"]);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_sends_and_deletes_nothing() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(1, HELLO_PDU)])
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let mut config = test_config(vec![100]);
    config.dry_run = true;

    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    assert_eq!(sink.call_count(), 0);
    assert!(deletions(&h.commands.lock().unwrap()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_deletion_failure_skips_slot_but_not_cycle() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(1, HELLO_PDU), (2, HELLO_PDU)])
        } else if cmd == "AT+CMGD=1" {
            vec!["ERROR".to_string()]
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let config = test_config(vec![100]);

    // the failed deletion must not fail the cycle
    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    let mut deleted = deletions(&h.commands.lock().unwrap());
    deleted.sort();
    assert_eq!(deleted, vec!["AT+CMGD=1", "AT+CMGD=2"]);
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_multipart_is_kept_not_forwarded() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(9, PART_A)])
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let config = test_config(vec![100]);

    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    assert_eq!(sink.call_count(), 0);
    assert!(deletions(&h.commands.lock().unwrap()).is_empty());
    assert_eq!(h.collector.pending_count(), 1);
}

#[tokio::test]
async fn test_stale_parts_reclaimed_without_forwarding() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            cmgl_response(&[(9, PART_A)])
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let mut config = test_config(vec![100]);
    config.multipart_max_age_secs = 1;

    // first cycle only observes the orphaned part
    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();
    assert_eq!(h.collector.pending_count(), 1);
    assert!(deletions(&h.commands.lock().unwrap()).is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;

    // second cycle re-lists it, finds it stale, reclaims the slot
    process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap();

    assert_eq!(sink.call_count(), 0);
    assert_eq!(deletions(&h.commands.lock().unwrap()), vec!["AT+CMGD=9"]);
    assert_eq!(h.collector.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_modem_device_error_surfaces_as_modem_failure() {
    let mut h = harness(|cmd| {
        if cmd == "AT+CMGL=4" {
            vec!["+CMS ERROR: 500".to_string()]
        } else {
            vec!["OK".to_string()]
        }
    });
    let sink = RecordingSink::default();
    let config = test_config(vec![100]);

    let err = process_messages(&mut h.at, &mut h.collector, &sink, &config, &h.cancel)
        .await
        .unwrap_err();
    match err {
        CycleError::Modem(at_err) => assert!(at_err.is_device_error()),
        other => panic!("expected modem error, got {other:?}"),
    }
}
