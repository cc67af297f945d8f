//! Poll cycle: list, decode, assemble, forward, delete
//!
//! One cycle lists everything in modem storage, threads the decoded frames
//! through the multipart collector, forwards every complete message to every
//! configured chat, and only then deletes the consumed storage slots. A
//! delivery failure aborts the cycle before any deletion, so the worst case is
//! redelivery next cycle — never loss. Deletion failures are logged and
//! skipped for the same reason.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::Local;
use smsgate_core::{parse_pdu, AssembledSms, MultipartCollector, StoredIndex};
use smsgate_modem::{AtError, AtTransport};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::render::format_message;
use crate::telegram::MessageSink;

/// Delivery attempts per destination before the cycle gives up.
const SEND_MAX_ATTEMPTS: u32 = 10;
/// First retry delay; doubles per attempt.
const SEND_BASE_DELAY: Duration = Duration::from_secs(5);
/// Backoff ceiling.
const SEND_MAX_DELAY: Duration = Duration::from_secs(300);

// ----------------------------------------------------------------------------
// Cycle Outcome
// ----------------------------------------------------------------------------

/// Why a poll cycle failed.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("modem command failed: {0}")]
    Modem(#[from] AtError),

    #[error("message delivery failed: {0}")]
    Delivery(String),

    /// Shutdown requested mid-cycle; not a failure.
    #[error("cycle interrupted by shutdown")]
    Cancelled,
}

// ----------------------------------------------------------------------------
// Poll Cycle
// ----------------------------------------------------------------------------

/// Run one full poll cycle against the modem.
pub async fn process_messages<P>(
    at: &mut AtTransport<P>,
    collector: &mut MultipartCollector,
    sink: &dyn MessageSink,
    config: &Config,
    cancel: &CancellationToken,
) -> Result<(), CycleError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    debug!("checking for new SMS messages");
    let (messages, to_delete) = list_messages(at, collector, config.multipart_max_age()).await?;

    if messages.is_empty() && to_delete.is_empty() {
        debug!("no messages found");
        return Ok(());
    }
    if messages.is_empty() {
        warn!(count = to_delete.len(), "no complete messages, but stale parts to reclaim");
    } else {
        info!(count = messages.len(), "found SMS messages");
    }

    for message in &messages {
        debug!(
            from = %message.sender,
            indices = ?message.indices,
            chars = message.text.chars().count(),
            "forwarding SMS"
        );
        let rendered = format_message(message);
        forward_to_all(sink, config, &rendered, cancel).await?;
        info!(from = %message.sender, indices = ?message.indices, "SMS forwarded");
    }

    delete_indices(at, config, &to_delete).await;

    // Stale groups leave the collector only now that their indices went
    // through deletion.
    if let Some(max_age) = config.multipart_max_age() {
        let evicted = collector.evict_stale(max_age, Instant::now());
        if evicted > 0 {
            warn!(evicted, "dropped stale multipart groups");
        }
    }

    Ok(())
}

/// List stored messages and thread them through the collector.
///
/// Returns the complete messages of this cycle and the de-duplicated set of
/// storage indices to delete once forwarding succeeds. A frame that fails to
/// decode is not dropped: it is forwarded as a placeholder naming the error
/// and the raw payload, and its slot is still reclaimed.
async fn list_messages<P>(
    at: &mut AtTransport<P>,
    collector: &mut MultipartCollector,
    max_age: Option<Duration>,
) -> Result<(Vec<AssembledSms>, BTreeSet<StoredIndex>), AtError>
where
    P: AsyncRead + AsyncWrite + Unpin,
{
    // 4 lists all messages regardless of read state.
    let lines = at.command("AT+CMGL=4").await?;
    debug!(lines = lines.len(), "message list received");

    let mut messages = Vec::new();
    let mut to_delete = BTreeSet::new();

    let mut iter = lines.iter();
    while let Some(line) = iter.next() {
        // Header shape: +CMGL: <index>,<stat>,<alpha>,<length>
        let Some(rest) = line.strip_prefix("+CMGL:") else {
            continue;
        };
        let index = match rest.split(',').next().map(str::trim).map(str::parse::<StoredIndex>) {
            Some(Ok(index)) => index,
            _ => {
                warn!(line = %line, "failed to parse message index");
                continue;
            }
        };
        let Some(pdu_line) = iter.next() else {
            break;
        };
        let pdu_hex = pdu_line.trim();

        match parse_pdu(pdu_hex) {
            Ok(message) => {
                if let Some(concat) = &message.concatenation {
                    debug!(
                        index,
                        reference = concat.reference,
                        part = concat.part_number,
                        total = concat.total_parts,
                        "multipart SMS part"
                    );
                }
                if let Some(assembled) = collector.add(index, message) {
                    to_delete.extend(assembled.indices.iter().copied());
                    messages.push(assembled);
                }
            }
            Err(err) => {
                warn!(index, error = %err, "failed to parse PDU");
                messages.push(AssembledSms {
                    sender: "unknown".to_string(),
                    smsc: None,
                    timestamp: Local::now().fixed_offset(),
                    text: format!("[PDU parse error: {err}]\nRaw: {pdu_hex}"),
                    total_parts: 1,
                    indices: vec![index],
                });
                to_delete.insert(index);
            }
        }
    }

    let pending = collector.pending_count();
    if pending > 0 {
        warn!(pending, "incomplete multipart messages are waiting for more parts");
    }

    if let Some(max_age) = max_age {
        let stale = collector.stale_indices(max_age, Instant::now());
        if !stale.is_empty() {
            warn!(count = stale.len(), max_age = ?max_age, "stale multipart parts detected");
            to_delete.extend(stale);
        }
    }

    Ok((messages, to_delete))
}

// ----------------------------------------------------------------------------
// Forwarding
// ----------------------------------------------------------------------------

/// Deliver one rendered message to every configured chat, in order.
///
/// A destination that exhausts its retries aborts the whole cycle; remaining
/// destinations are not attempted, and nothing gets deleted this cycle.
async fn forward_to_all(
    sink: &dyn MessageSink,
    config: &Config,
    text: &str,
    cancel: &CancellationToken,
) -> Result<(), CycleError> {
    if config.dry_run {
        info!(chat_ids = ?config.chat_ids, "dry run: would send message to Telegram");
        return Ok(());
    }
    for &chat_id in &config.chat_ids {
        send_with_retry(sink, chat_id, text, cancel).await?;
    }
    Ok(())
}

/// Deliver to one chat with capped exponential backoff.
async fn send_with_retry(
    sink: &dyn MessageSink,
    chat_id: i64,
    text: &str,
    cancel: &CancellationToken,
) -> Result<(), CycleError> {
    let mut delay = SEND_BASE_DELAY;
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        attempt += 1;
        debug!(chat_id, attempt, "sending to Telegram");

        let err = match sink.send(chat_id, text).await {
            Ok(()) => {
                debug!(chat_id, "message sent");
                return Ok(());
            }
            Err(err) => err,
        };
        warn!(
            chat_id,
            attempt,
            error = %err,
            next_retry = ?delay,
            "failed to send to Telegram"
        );

        if attempt >= SEND_MAX_ATTEMPTS {
            return Err(CycleError::Delivery(format!(
                "chat {chat_id} failed after {SEND_MAX_ATTEMPTS} attempts: {err}"
            )));
        }
        if cancel.run_until_cancelled(sleep(delay)).await.is_none() {
            return Err(CycleError::Cancelled);
        }
        delay = (delay * 2).min(SEND_MAX_DELAY);
    }
}

// ----------------------------------------------------------------------------
// Deletion
// ----------------------------------------------------------------------------

/// Delete forwarded (and stale) slots from modem storage.
///
/// Runs only after every message of the cycle was delivered everywhere. A
/// slot that fails to delete stays on the SIM and the message may be
/// redelivered next cycle; that is the accepted at-least-once trade.
async fn delete_indices<P>(
    at: &mut AtTransport<P>,
    config: &Config,
    indices: &BTreeSet<StoredIndex>,
) where
    P: AsyncRead + AsyncWrite + Unpin,
{
    if indices.is_empty() {
        return;
    }
    if config.dry_run {
        info!(?indices, "dry run: skipping SMS deletion");
        return;
    }
    for &index in indices {
        debug!(index, "deleting SMS from modem storage");
        if let Err(err) = at.command(&format!("AT+CMGD={index}")).await {
            error!(index, error = %err, "failed to delete SMS");
        }
    }
}
