//! Blob graph editing: lookup, insertion, CodeDirectory relocation and
//! canonical slot ordering.
//!
//! After a transformation the SuperBlob must list its slots as
//!
//! 1. replacement CodeDirectory (primary slot)
//! 2. Requirements
//! 3. Entitlements
//! 4. DER Entitlements (when present)
//! 5. original CodeDirectory (alternate slot)
//! 6. Signature

use super::superblob::{BlobRecord, SlotType, SuperBlob};
use crate::{Error, Result};

/// What to do with an existing alternate CodeDirectory when the primary one
/// is replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlternatePolicy {
    /// Discard the current primary content and keep the existing alternate
    /// CodeDirectory as the one that gets re-identified.
    ///
    /// A file that was already transformed keeps its real CodeDirectory in
    /// the alternate slot, so a second pass leaves the structure unchanged.
    #[default]
    KeepAlternate,
    /// Move the current primary content into the alternate slot, discarding
    /// whatever the alternate slot held before.
    ReplaceAlternate,
}

/// Slot order enforced by [`SuperBlob::canonicalize`].
pub const CANONICAL_ORDER: [SlotType; 6] = [
    SlotType::CodeDirectory,
    SlotType::Requirements,
    SlotType::Entitlements,
    SlotType::DerEntitlements,
    SlotType::AlternateCodeDirectories,
    SlotType::Signature,
];

impl SuperBlob {
    /// Index of the first record in `slot`.
    pub fn position(&self, slot: SlotType) -> Option<usize> {
        self.records.iter().position(|r| r.slot == slot)
    }

    /// First record in `slot`.
    pub fn find(&self, slot: SlotType) -> Option<&BlobRecord> {
        self.records.iter().find(|r| r.slot == slot)
    }

    /// First record in `slot`, mutably.
    pub fn find_mut(&mut self, slot: SlotType) -> Option<&mut BlobRecord> {
        self.records.iter_mut().find(|r| r.slot == slot)
    }

    /// Like [`find`](Self::find) but a missing slot is an error.
    pub fn require(&self, slot: SlotType) -> Result<&BlobRecord> {
        self.find(slot).ok_or(Error::MissingSlot(slot))
    }

    /// Like [`find_mut`](Self::find_mut) but a missing slot is an error.
    pub fn require_mut(&mut self, slot: SlotType) -> Result<&mut BlobRecord> {
        self.find_mut(slot).ok_or(Error::MissingSlot(slot))
    }

    /// Append a record at the end of the sequence.
    pub fn push(&mut self, record: BlobRecord) {
        self.records.push(record);
    }

    /// Insert `record` directly after the first record in `anchor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Logic`] if no record occupies `anchor`.
    pub fn insert_after(&mut self, anchor: SlotType, record: BlobRecord) -> Result<()> {
        let at = self
            .position(anchor)
            .ok_or_else(|| Error::Logic(format!("cannot insert after absent {} record", anchor)))?;
        self.records.insert(at + 1, record);
        Ok(())
    }

    /// Remove and return the first record in `slot`.
    pub fn remove(&mut self, slot: SlotType) -> Option<BlobRecord> {
        let at = self.position(slot)?;
        Some(self.records.remove(at))
    }

    /// Install `content` in `slot`, replacing the existing record's bytes or
    /// appending a new record when the slot is absent.
    pub fn replace_or_push(&mut self, slot: SlotType, content: Vec<u8>) {
        match self.find_mut(slot) {
            Some(record) => record.content = content,
            None => self.push(BlobRecord::new(slot, content)),
        }
    }

    /// Install `replacement` as the primary CodeDirectory.
    ///
    /// The first record must be the primary CodeDirectory. Without an
    /// alternate slot the original primary content is appended as the
    /// alternate CodeDirectory. With one, `policy` decides which of the two
    /// existing CodeDirectories survives in the alternate slot; only one
    /// alternate record ever exists afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSlot`] if the sequence does not start with a
    /// primary CodeDirectory.
    pub fn relocate_primary_code_directory(
        &mut self,
        replacement: Vec<u8>,
        policy: AlternatePolicy,
    ) -> Result<()> {
        match self.records.first() {
            Some(first) if first.slot == SlotType::CodeDirectory => {}
            _ => return Err(Error::MissingSlot(SlotType::CodeDirectory)),
        }

        let original = std::mem::replace(&mut self.records[0].content, replacement);

        match (self.position(SlotType::AlternateCodeDirectories), policy) {
            (None, _) => {
                tracing::debug!("moving original CodeDirectory to the alternate slot");
                self.push(BlobRecord::new(SlotType::AlternateCodeDirectories, original));
            }
            (Some(_), AlternatePolicy::KeepAlternate) => {
                tracing::debug!("alternate CodeDirectory present, discarding previous primary");
            }
            (Some(at), AlternatePolicy::ReplaceAlternate) => {
                tracing::debug!("alternate CodeDirectory present, replacing it with previous primary");
                self.records[at].content = original;
            }
        }

        // A single logical alternate CodeDirectory survives.
        let mut seen = false;
        self.records.retain(|r| {
            if r.slot != SlotType::AlternateCodeDirectories {
                return true;
            }
            let keep = !seen;
            seen = true;
            keep
        });

        Ok(())
    }

    /// Reorder the sequence into [`CANONICAL_ORDER`].
    ///
    /// Records in slots outside the canonical set are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingSlot`] if any canonical slot other than DER
    /// Entitlements is absent. The sequence is left untouched on error.
    pub fn canonicalize(&mut self) -> Result<()> {
        for slot in CANONICAL_ORDER {
            if slot != SlotType::DerEntitlements && self.find(slot).is_none() {
                return Err(Error::MissingSlot(slot));
            }
        }

        let mut remaining = std::mem::take(&mut self.records);
        for slot in CANONICAL_ORDER {
            if let Some(at) = remaining.iter().position(|r| r.slot == slot) {
                self.records.push(remaining.remove(at));
            }
        }

        for dropped in remaining {
            tracing::warn!(slot = %dropped.slot, size = dropped.content.len(), "dropping non-canonical blob");
        }

        Ok(())
    }
}
