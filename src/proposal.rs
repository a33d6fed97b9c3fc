//! Block proposal assembly.
//!
//! A proposal is a byte-bounded list of transactions in a fixed order:
//! `[attestation, operations?, other txs..., funding votes, price updates]`.
//! Any failure along the way yields the canonical empty proposal; a partial
//! proposal could not be re-derived by other validators.

use crate::config::ProposalConfig;
use crate::types::ONE_MILLION;
use log::{debug, warn};
use serde::Deserialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProposalError {
    #[error("{slot} payload unavailable: {reason}")]
    Unavailable { slot: &'static str, reason: String },
    #[error("{slot} payload is empty")]
    EmptyPayload { slot: &'static str },
    #[error("{slot} payload already set")]
    SlotAlreadySet { slot: &'static str },
    #[error("adding {bytes} bytes for {slot} exceeds budget (used {used} of {max})")]
    BudgetExceeded {
        slot: &'static str,
        bytes: u64,
        used: u64,
        max: u64,
    },
    #[error("other tx at pool index {index} is empty")]
    EmptyOtherTx { index: usize },
}

/// Validator-supplied payloads that every proposal must carry.
pub trait FixedGroupSource {
    /// Attestation (vote extension) payload. May be empty.
    fn attestation(&self) -> Result<Vec<u8>, ProposalError>;
    fn price_updates(&self) -> Result<Vec<u8>, ProposalError>;
    fn funding_votes(&self) -> Result<Vec<u8>, ProposalError>;
}

pub trait OperationsSource {
    /// Encoded operations queue. Empty when there is nothing to propose.
    fn operations_payload(&self) -> Result<Vec<u8>, ProposalError>;
}

pub trait TxFilter {
    fn is_disallowed(&self, tx: &[u8]) -> bool;
}

#[derive(Debug, Deserialize)]
struct PoolTx {
    #[serde(default)]
    messages: Vec<PoolMessage>,
}

#[derive(Debug, Deserialize)]
struct PoolMessage {
    type_url: String,
}

/// Drops pool txs that carry a disallowed message type. Txs that do not decode
/// are left for block execution to reject.
#[derive(Debug, Clone, Default)]
pub struct MessageTypeFilter {
    disallowed: BTreeSet<String>,
}

impl MessageTypeFilter {
    pub fn new(disallowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            disallowed: disallowed.into_iter().collect(),
        }
    }

    pub fn from_config(config: &ProposalConfig) -> Self {
        Self::new(config.disallowed_message_types.iter().cloned())
    }
}

impl TxFilter for MessageTypeFilter {
    fn is_disallowed(&self, tx: &[u8]) -> bool {
        match serde_json::from_slice::<PoolTx>(tx) {
            Ok(decoded) => decoded.messages.iter().any(|m| self.disallowed.contains(&m.type_url)),
            Err(_) => false,
        }
    }
}

/// Running byte budget and payload slots of one proposal.
#[derive(Debug, Clone)]
pub struct ProposalAccumulator {
    max_bytes: u64,
    used_bytes: u64,
    attestation: Option<Vec<u8>>,
    operations: Option<Vec<u8>>,
    others: Vec<Vec<u8>>,
    funding: Option<Vec<u8>>,
    prices: Option<Vec<u8>>,
}

impl ProposalAccumulator {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
            attestation: None,
            operations: None,
            others: Vec::new(),
            funding: None,
            prices: None,
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn available_bytes(&self) -> u64 {
        self.max_bytes - self.used_bytes
    }

    fn reserve(&mut self, slot: &'static str, bytes: u64) -> Result<(), ProposalError> {
        if bytes > self.available_bytes() {
            return Err(ProposalError::BudgetExceeded {
                slot,
                bytes,
                used: self.used_bytes,
                max: self.max_bytes,
            });
        }
        self.used_bytes += bytes;
        Ok(())
    }

    fn fill_slot(
        slot: &'static str,
        target: &mut Option<Vec<u8>>,
        payload: Vec<u8>,
    ) -> Result<(), ProposalError> {
        if target.is_some() {
            return Err(ProposalError::SlotAlreadySet { slot });
        }
        *target = Some(payload);
        Ok(())
    }

    pub fn set_attestation(&mut self, payload: Vec<u8>) -> Result<(), ProposalError> {
        if self.attestation.is_some() {
            return Err(ProposalError::SlotAlreadySet { slot: "attestation" });
        }
        self.reserve("attestation", payload.len() as u64)?;
        Self::fill_slot("attestation", &mut self.attestation, payload)
    }

    pub fn set_price_updates(&mut self, payload: Vec<u8>) -> Result<(), ProposalError> {
        if payload.is_empty() {
            return Err(ProposalError::EmptyPayload { slot: "price updates" });
        }
        if self.prices.is_some() {
            return Err(ProposalError::SlotAlreadySet { slot: "price updates" });
        }
        self.reserve("price updates", payload.len() as u64)?;
        Self::fill_slot("price updates", &mut self.prices, payload)
    }

    pub fn set_funding_votes(&mut self, payload: Vec<u8>) -> Result<(), ProposalError> {
        if payload.is_empty() {
            return Err(ProposalError::EmptyPayload { slot: "funding votes" });
        }
        if self.funding.is_some() {
            return Err(ProposalError::SlotAlreadySet { slot: "funding votes" });
        }
        self.reserve("funding votes", payload.len() as u64)?;
        Self::fill_slot("funding votes", &mut self.funding, payload)
    }

    /// An empty operations payload leaves the slot out of the proposal.
    pub fn set_operations(&mut self, payload: Vec<u8>) -> Result<(), ProposalError> {
        if payload.is_empty() {
            return Ok(());
        }
        if self.operations.is_some() {
            return Err(ProposalError::SlotAlreadySet { slot: "operations" });
        }
        self.reserve("operations", payload.len() as u64)?;
        Self::fill_slot("operations", &mut self.operations, payload)
    }

    pub fn add_other_tx(&mut self, tx: Vec<u8>) -> Result<(), ProposalError> {
        self.reserve("other txs", tx.len() as u64)?;
        self.others.push(tx);
        Ok(())
    }

    /// Final ordered tx list. Fails if a mandatory slot is missing.
    pub fn into_txs(self) -> Result<Vec<Vec<u8>>, ProposalError> {
        let attestation = self.attestation.ok_or(ProposalError::Unavailable {
            slot: "attestation",
            reason: "not set".to_string(),
        })?;
        let funding = self.funding.ok_or(ProposalError::Unavailable {
            slot: "funding votes",
            reason: "not set".to_string(),
        })?;
        let prices = self.prices.ok_or(ProposalError::Unavailable {
            slot: "price updates",
            reason: "not set".to_string(),
        })?;

        let mut txs = Vec::with_capacity(self.others.len() + 4);
        txs.push(attestation);
        if let Some(operations) = self.operations {
            txs.push(operations);
        }
        txs.extend(self.others);
        txs.push(funding);
        txs.push(prices);
        Ok(txs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    pub txs: Vec<Vec<u8>>,
    pub used_bytes: u64,
}

impl Proposal {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

pub struct ProposalAssembler<'a> {
    config: &'a ProposalConfig,
    filter: &'a dyn TxFilter,
}

impl<'a> ProposalAssembler<'a> {
    pub fn new(config: &'a ProposalConfig, filter: &'a dyn TxFilter) -> Self {
        Self { config, filter }
    }

    /// Build a proposal of at most `max_bytes`. Never fails: any error yields the empty proposal.
    pub fn prepare_proposal(
        &self,
        max_bytes: u64,
        fixed: &dyn FixedGroupSource,
        operations: &dyn OperationsSource,
        pool: &[Vec<u8>],
    ) -> Proposal {
        match self.try_prepare(max_bytes, fixed, operations, pool) {
            Ok(proposal) => {
                debug!(
                    "proposal assembled txs={} used_bytes={} max_bytes={}",
                    proposal.txs.len(),
                    proposal.used_bytes,
                    max_bytes
                );
                proposal
            }
            Err(err) => {
                warn!("proposal assembly failed, proposing empty block err={}", err);
                Proposal::empty()
            }
        }
    }

    fn try_prepare(
        &self,
        max_bytes: u64,
        fixed: &dyn FixedGroupSource,
        operations: &dyn OperationsSource,
        pool: &[Vec<u8>],
    ) -> Result<Proposal, ProposalError> {
        let mut acc = ProposalAccumulator::new(max_bytes);

        acc.set_attestation(fixed.attestation()?)?;
        acc.set_price_updates(fixed.price_updates()?)?;
        acc.set_funding_votes(fixed.funding_votes()?)?;

        // first pass: a share of what the fixed group left
        let first_pass_budget =
            acc.available_bytes() * u64::from(self.config.other_txs_share_ppm) / u64::from(ONE_MILLION);
        let mut first_pass_used = 0u64;
        let mut remainder: Vec<&Vec<u8>> = Vec::new();
        for (index, tx) in pool.iter().enumerate() {
            if tx.is_empty() {
                return Err(ProposalError::EmptyOtherTx { index });
            }
            if self.filter.is_disallowed(tx) {
                debug!("dropping disallowed pool tx index={}", index);
                continue;
            }
            let len = tx.len() as u64;
            if first_pass_used + len <= first_pass_budget {
                acc.add_other_tx(tx.clone())?;
                first_pass_used += len;
            } else {
                remainder.push(tx);
            }
        }

        acc.set_operations(operations.operations_payload()?)?;

        // second pass: whatever is left after operations
        for tx in remainder {
            if (tx.len() as u64) <= acc.available_bytes() {
                acc.add_other_tx(tx.clone())?;
            }
        }

        let used_bytes = acc.used_bytes();
        Ok(Proposal {
            txs: acc.into_txs()?,
            used_bytes,
        })
    }
}
