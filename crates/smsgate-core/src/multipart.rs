//! Multipart SMS reassembly
//!
//! Concatenated messages arrive as independent frames sharing a reference
//! number. The collector groups them by `(sender, reference)` — two senders
//! reusing the same reference never collide — and releases a group the moment
//! its last part arrives. Parts stay in modem storage until the pipeline
//! deletes them, so every poll re-lists parts the collector has already seen;
//! insertion is therefore idempotent, and the first observation time is what
//! the staleness sweep measures.
//!
//! Reassembly state is memory-only. A process restart forgets partially
//! received groups; their parts are still on the SIM and will re-enter the
//! collector on the first poll of the next session.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::types::{AssembledSms, PduMessage, StoredIndex};

// ----------------------------------------------------------------------------
// Reassembly Group
// ----------------------------------------------------------------------------

/// One received part awaiting its siblings.
#[derive(Debug, Clone)]
struct StoredPart {
    message: PduMessage,
    index: StoredIndex,
    first_seen: Instant,
}

/// Parts of one concatenated message, keyed by 1-based part number.
#[derive(Debug, Clone)]
struct ReassemblyGroup {
    /// Declared part count; fixed by the first part seen for the group.
    total_parts: u8,
    parts: BTreeMap<u8, StoredPart>,
}

impl ReassemblyGroup {
    fn is_complete(&self) -> bool {
        self.parts.len() >= usize::from(self.total_parts)
    }

    fn oldest_first_seen(&self) -> Option<Instant> {
        self.parts.values().map(|part| part.first_seen).min()
    }

    fn indices(&self) -> Vec<StoredIndex> {
        self.parts.values().map(|part| part.index).collect()
    }

    /// Concatenate part texts in ascending part order.
    ///
    /// Assembly is best-effort over whatever slots are filled; sender, SMSC
    /// and timestamp come from part 1, falling back to the lowest part
    /// present.
    fn assemble(&self) -> Option<AssembledSms> {
        let head = self.parts.get(&1).or_else(|| self.parts.values().next())?;

        let mut text = String::new();
        for number in 1..=self.total_parts {
            if let Some(part) = self.parts.get(&number) {
                text.push_str(&part.message.text);
            }
        }

        Some(AssembledSms {
            sender: head.message.sender.clone(),
            smsc: head.message.smsc.clone(),
            timestamp: head.message.timestamp,
            text,
            total_parts: self.total_parts,
            indices: self.indices(),
        })
    }
}

// ----------------------------------------------------------------------------
// Collector
// ----------------------------------------------------------------------------

/// Groups incomplete concatenated messages, keyed by `(sender, reference)`.
#[derive(Debug, Default)]
pub struct MultipartCollector {
    groups: BTreeMap<(String, u16), ReassemblyGroup>,
}

impl MultipartCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one decoded frame into the collector.
    ///
    /// A non-concatenated frame passes straight through as a single-part
    /// message owning its own index. A concatenated frame joins its group;
    /// when the group's distinct-part count reaches the declared total, the
    /// group is removed from the live set and returned as one assembled
    /// message carrying the storage indices of all its parts.
    pub fn add(&mut self, index: StoredIndex, message: PduMessage) -> Option<AssembledSms> {
        let Some(concat) = message.concatenation else {
            return Some(AssembledSms {
                sender: message.sender,
                smsc: message.smsc,
                timestamp: message.timestamp,
                text: message.text,
                total_parts: 1,
                indices: vec![index],
            });
        };

        let key = (message.sender.clone(), concat.reference);
        let group = self.groups.entry(key.clone()).or_insert_with(|| ReassemblyGroup {
            total_parts: concat.total_parts,
            parts: BTreeMap::new(),
        });

        // Re-listed parts are no-ops; the original observation time stands.
        group.parts.entry(concat.part_number).or_insert_with(|| StoredPart {
            message,
            index,
            first_seen: Instant::now(),
        });

        if group.is_complete() {
            let assembled = group.assemble();
            self.groups.remove(&key);
            return assembled;
        }
        None
    }

    /// Number of incomplete groups, for operational visibility.
    pub fn pending_count(&self) -> usize {
        self.groups.len()
    }

    /// Storage indices of every part in groups whose oldest part was first
    /// seen more than `max_age` ago.
    ///
    /// Listing does not drop the groups; the caller deletes the indices and
    /// then calls [`evict_stale`](Self::evict_stale) as part of that cleanup.
    pub fn stale_indices(&self, max_age: Duration, now: Instant) -> Vec<StoredIndex> {
        let mut indices = Vec::new();
        for group in self.groups.values() {
            if let Some(oldest) = group.oldest_first_seen() {
                if now.saturating_duration_since(oldest) > max_age {
                    indices.extend(group.indices());
                }
            }
        }
        indices
    }

    /// Drop groups whose oldest part exceeds `max_age`, returning how many
    /// were removed.
    pub fn evict_stale(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.groups.len();
        self.groups.retain(|_, group| match group.oldest_first_seen() {
            Some(oldest) => now.saturating_duration_since(oldest) <= max_age,
            None => false,
        });
        before - self.groups.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Concatenation;
    use chrono::{FixedOffset, TimeZone};

    fn part(sender: &str, reference: u16, number: u8, total: u8, text: &str) -> PduMessage {
        PduMessage {
            smsc: Some("+1987654321".to_string()),
            sender: sender.to_string(),
            timestamp: FixedOffset::east_opt(0)
                .unwrap()
                .with_ymd_and_hms(2025, 12, 11, 18, 21, 49)
                .unwrap(),
            text: text.to_string(),
            concatenation: Some(Concatenation {
                reference,
                part_number: number,
                total_parts: total,
            }),
        }
    }

    fn single(sender: &str, text: &str) -> PduMessage {
        PduMessage {
            concatenation: None,
            ..part(sender, 0, 1, 1, text)
        }
    }

    #[test]
    fn test_single_part_passes_through() {
        let mut collector = MultipartCollector::new();
        let result = collector.add(7, single("+1234567890", "Single message")).unwrap();
        assert_eq!(result.text, "Single message");
        assert_eq!(result.total_parts, 1);
        assert_eq!(result.indices, vec![7]);
        assert_eq!(collector.pending_count(), 0);
    }

    #[test]
    fn test_out_of_order_assembly() {
        let mut collector = MultipartCollector::new();

        assert!(collector.add(2, part("+1234567890", 42, 2, 3, "B")).is_none());
        assert!(collector.add(1, part("+1234567890", 42, 1, 3, "A")).is_none());
        assert_eq!(collector.pending_count(), 1);

        let result = collector.add(3, part("+1234567890", 42, 3, 3, "C")).unwrap();
        assert_eq!(result.text, "ABC");
        assert_eq!(result.total_parts, 3);
        assert_eq!(result.indices, vec![1, 2, 3]);
        assert_eq!(collector.pending_count(), 0);
    }

    #[test]
    fn test_metadata_from_first_part() {
        let mut collector = MultipartCollector::new();
        collector.add(12, part("+1234567890", 9, 2, 2, " tail"));
        let result = collector.add(11, part("+1234567890", 9, 1, 2, "head")).unwrap();

        assert_eq!(result.sender, "+1234567890");
        assert_eq!(result.smsc.as_deref(), Some("+1987654321"));
        assert_eq!(result.text, "head tail");
        assert_eq!(result.timestamp.to_rfc3339(), "2025-12-11T18:21:49+00:00");
    }

    #[test]
    fn test_senders_with_same_reference_do_not_collide() {
        let mut collector = MultipartCollector::new();
        collector.add(1, part("+1111111111", 1, 1, 2, "from sender 1"));
        collector.add(2, part("+2222222222", 1, 1, 2, "from sender 2"));
        assert_eq!(collector.pending_count(), 2);
    }

    #[test]
    fn test_relisted_part_is_idempotent() {
        let mut collector = MultipartCollector::new();
        collector.add(1, part("+1234567890", 5, 1, 2, "A"));
        // the same part shows up again on the next poll
        assert!(collector.add(1, part("+1234567890", 5, 1, 2, "A")).is_none());
        assert_eq!(collector.pending_count(), 1);

        let result = collector.add(2, part("+1234567890", 5, 2, 2, "B")).unwrap();
        assert_eq!(result.text, "AB");
        assert_eq!(result.indices, vec![1, 2]);
    }

    #[test]
    fn test_stale_indices_and_eviction() {
        let mut collector = MultipartCollector::new();
        collector.add(4, part("+1234567890", 8, 1, 3, "never"));
        collector.add(5, part("+1234567890", 8, 2, 3, "completes"));

        let max_age = Duration::from_secs(60);

        // fresh group: nothing is stale yet
        assert!(collector.stale_indices(max_age, Instant::now()).is_empty());

        // same question asked two minutes from now
        let later = Instant::now() + Duration::from_secs(120);
        let mut stale = collector.stale_indices(max_age, later);
        stale.sort_unstable();
        assert_eq!(stale, vec![4, 5]);

        // listing alone must not drop the group
        assert_eq!(collector.pending_count(), 1);
        assert_eq!(collector.evict_stale(max_age, later), 1);
        assert_eq!(collector.pending_count(), 0);
    }
}
