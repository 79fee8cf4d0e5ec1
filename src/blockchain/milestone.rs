//! Height-activated protocol parameters and the slot clock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::transaction::TransactionType;

/// Errors raised while validating a milestone list
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MilestoneError {
    #[error("Milestone list is empty")]
    Empty,

    #[error("First milestone must activate at height 1, found {0}")]
    FirstHeight(u64),

    #[error("First milestone must carry the ledger epoch")]
    MissingEpoch,

    #[error("Milestones are not sorted by height at index {0}")]
    Unsorted(usize),

    #[error("Invalid milestone at height {height}: {reason}")]
    Invalid { height: u64, reason: String },
}

/// Block-level limits of a milestone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockLimits {
    pub version: u32,
    pub max_transactions: u32,
    pub max_payload: u32,
    /// Use the full 32-byte digest as block id instead of the legacy 8 bytes
    #[serde(default)]
    pub id_full_sha256: bool,
}

/// Static fee per transaction type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticFees {
    pub transfer: u64,
    pub second_signature: u64,
    pub delegate_registration: u64,
    pub vote: u64,
    pub multi_signature: u64,
    pub ipfs: u64,
    pub timelock_transfer: u64,
    pub multi_payment: u64,
    pub delegate_resignation: u64,
}

impl StaticFees {
    pub fn get(&self, kind: TransactionType) -> u64 {
        match kind {
            TransactionType::Transfer => self.transfer,
            TransactionType::SecondSignature => self.second_signature,
            TransactionType::DelegateRegistration => self.delegate_registration,
            TransactionType::Vote => self.vote,
            TransactionType::MultiSignature => self.multi_signature,
            TransactionType::Ipfs => self.ipfs,
            TransactionType::TimelockTransfer => self.timelock_transfer,
            TransactionType::MultiPayment => self.multi_payment,
            TransactionType::DelegateResignation => self.delegate_resignation,
        }
    }
}

impl Default for StaticFees {
    fn default() -> Self {
        StaticFees {
            transfer: 10_000_000,
            second_signature: 500_000_000,
            delegate_registration: 2_500_000_000,
            vote: 100_000_000,
            multi_signature: 500_000_000,
            ipfs: 0,
            timelock_transfer: 0,
            multi_payment: 0,
            delegate_resignation: 0,
        }
    }
}

/// A set of protocol parameters active from `height` onwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub height: u64,
    pub reward: u64,
    /// Seconds per forging slot
    pub blocktime: u32,
    pub active_delegates: u32,
    pub block: BlockLimits,
    #[serde(default)]
    pub fees: StaticFees,
    #[serde(default = "default_vendor_field_length")]
    pub vendor_field_length: u8,
    /// Ledger epoch. Only meaningful on the first milestone.
    #[serde(default)]
    pub epoch: Option<DateTime<Utc>>,
}

fn default_vendor_field_length() -> u8 {
    64
}

/// Sorted, append-only milestone table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Milestone>", into = "Vec<Milestone>")]
pub struct Milestones {
    entries: Vec<Milestone>,
    epoch: DateTime<Utc>,
}

impl TryFrom<Vec<Milestone>> for Milestones {
    type Error = MilestoneError;

    fn try_from(entries: Vec<Milestone>) -> Result<Self, Self::Error> {
        Milestones::new(entries)
    }
}

impl From<Milestones> for Vec<Milestone> {
    fn from(milestones: Milestones) -> Self {
        milestones.entries
    }
}

impl Milestones {
    pub fn new(entries: Vec<Milestone>) -> Result<Self, MilestoneError> {
        let first = entries.first().ok_or(MilestoneError::Empty)?;
        if first.height != 1 {
            return Err(MilestoneError::FirstHeight(first.height));
        }
        let epoch = first.epoch.ok_or(MilestoneError::MissingEpoch)?;

        for (i, pair) in entries.windows(2).enumerate() {
            if pair[1].height <= pair[0].height {
                return Err(MilestoneError::Unsorted(i + 1));
            }
        }
        for milestone in &entries {
            if milestone.blocktime == 0 {
                return Err(MilestoneError::Invalid {
                    height: milestone.height,
                    reason: "blocktime must be positive".to_string(),
                });
            }
            if milestone.active_delegates == 0 {
                return Err(MilestoneError::Invalid {
                    height: milestone.height,
                    reason: "activeDelegates must be positive".to_string(),
                });
            }
        }

        Ok(Milestones { entries, epoch })
    }

    /// The milestone with the highest activation height not above `height`
    pub fn get(&self, height: u64) -> &Milestone {
        let index = self.entries.partition_point(|m| m.height <= height);
        // Heights below 1 fall back to the first milestone
        &self.entries[index.saturating_sub(1)]
    }

    pub fn epoch(&self) -> DateTime<Utc> {
        self.epoch
    }

    pub fn entries(&self) -> &[Milestone] {
        &self.entries
    }
}

/// Maps wall-clock time to forging slots
#[derive(Debug, Clone)]
pub struct Slots<'a> {
    milestones: &'a Milestones,
}

impl<'a> Slots<'a> {
    pub fn new(milestones: &'a Milestones) -> Self {
        Slots { milestones }
    }

    /// Seconds elapsed since the ledger epoch, clamped at zero
    pub fn get_time(&self) -> u32 {
        self.time_at(Utc::now())
    }

    pub fn time_at(&self, now: DateTime<Utc>) -> u32 {
        let seconds = (now - self.milestones.epoch()).num_seconds();
        seconds.clamp(0, u32::MAX as i64) as u32
    }

    /// `floor(epoch_seconds / blocktime)` with the blocktime active at `height`
    pub fn get_slot_number(&self, height: u64, epoch_seconds: u32) -> u64 {
        let blocktime = self.milestones.get(height).blocktime;
        (epoch_seconds / blocktime) as u64
    }

    /// Epoch seconds at which `slot` begins
    pub fn get_slot_time(&self, height: u64, slot: u64) -> u64 {
        slot * self.milestones.get(height).blocktime as u64
    }

    /// The real-time instant at which an epoch timestamp falls
    pub fn get_real_time(&self, epoch_seconds: u32) -> DateTime<Utc> {
        self.milestones.epoch() + chrono::Duration::seconds(epoch_seconds as i64)
    }
}
