use std::collections::{btree_map, BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::contracts::Contract;
use crate::refs::{ContractId, Party, TemplateId};

pub type Digest32 = [u8; 32];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("contract {0} already exists")]
    DuplicateContract(ContractId),
    #[error("contract {0} is not active")]
    InactiveContract(ContractId),
    #[error("empty transaction")]
    EmptyTransaction,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerMutation {
    Create { contract: Contract },
    Archive { id: ContractId },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    Created {
        id: ContractId,
        template: TemplateId,
        owner: Party,
    },
    Archived {
        id: ContractId,
        template: TemplateId,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LedgerMeta {
    pub height: u64,
    #[serde(with = "serde_digest::option")]
    pub previous_tx: Option<Digest32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionReceipt {
    #[serde(with = "serde_digest")]
    pub tx_id: Digest32,
    pub height: u64,
    pub events: Vec<LedgerEvent>,
}

impl TransactionReceipt {
    fn seal(height: u64, previous: Option<Digest32>, events: Vec<LedgerEvent>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"capledger-tx");
        hasher.update(height.to_le_bytes());
        if let Some(prev) = previous {
            hasher.update(prev);
        }
        for event in &events {
            // LedgerEvent holds only strings; encoding cannot fail.
            hasher.update(serde_json::to_vec(event).unwrap_or_default());
        }
        Self {
            tx_id: hasher.finalize().into(),
            height,
            events,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LedgerSnapshot {
    pub meta: LedgerMeta,
    pub active: Vec<Contract>,
    pub events: Vec<LedgerEvent>,
    #[serde(with = "serde_digest")]
    pub state_root: Digest32,
}

/// Live contract table plus the history needed for identity lookups.
#[derive(Default, Debug)]
pub struct LedgerState {
    pub meta: LedgerMeta,
    active: BTreeMap<ContractId, Contract>,
    /// Template of every contract ever created, archived ones included.
    known: BTreeMap<ContractId, TemplateId>,
    events: Vec<LedgerEvent>,
    receipts: Vec<TransactionReceipt>,
}

impl LedgerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self, id: &ContractId) -> Option<&Contract> {
        self.active.get(id)
    }

    pub fn is_active(&self, id: &ContractId) -> bool {
        self.active.contains_key(id)
    }

    pub fn template_of(&self, id: &ContractId) -> Option<&TemplateId> {
        self.known.get(id)
    }

    pub fn active_contracts(&self) -> btree_map::Values<'_, ContractId, Contract> {
        self.active.values()
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    pub fn receipts(&self) -> &[TransactionReceipt] {
        &self.receipts
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            meta: self.meta.clone(),
            active: self.active.values().cloned().collect(),
            events: self.events.clone(),
            state_root: compute_state_root(&self.active),
        }
    }

    pub fn state_root(&self) -> Digest32 {
        compute_state_root(&self.active)
    }

    /// Applies `mutations` as one transaction. The whole batch is checked
    /// against the current table first; on error nothing changes.
    pub fn apply_transaction(
        &mut self,
        mutations: &[LedgerMutation],
    ) -> Result<TransactionReceipt, LedgerError> {
        if mutations.is_empty() {
            return Err(LedgerError::EmptyTransaction);
        }
        self.validate(mutations)?;

        let mut events = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            match mutation {
                LedgerMutation::Create { contract } => {
                    self.known
                        .insert(contract.id.clone(), contract.template.clone());
                    self.active.insert(contract.id.clone(), contract.clone());
                    events.push(LedgerEvent::Created {
                        id: contract.id.clone(),
                        template: contract.template.clone(),
                        owner: contract.owner.clone(),
                    });
                }
                LedgerMutation::Archive { id } => {
                    if let Some(contract) = self.active.remove(id) {
                        events.push(LedgerEvent::Archived {
                            id: contract.id,
                            template: contract.template,
                        });
                    }
                }
            }
        }

        self.meta.height += 1;
        let receipt = TransactionReceipt::seal(self.meta.height, self.meta.previous_tx, events);
        self.meta.previous_tx = Some(receipt.tx_id);
        self.events.extend(receipt.events.iter().cloned());
        self.receipts.push(receipt.clone());
        Ok(receipt)
    }

    fn validate(&self, mutations: &[LedgerMutation]) -> Result<(), LedgerError> {
        let mut created: BTreeSet<&ContractId> = BTreeSet::new();
        let mut archived: BTreeSet<&ContractId> = BTreeSet::new();
        for mutation in mutations {
            match mutation {
                LedgerMutation::Create { contract } => {
                    if self.known.contains_key(&contract.id) || !created.insert(&contract.id) {
                        return Err(LedgerError::DuplicateContract(contract.id.clone()));
                    }
                }
                LedgerMutation::Archive { id } => {
                    let live = self.active.contains_key(id) || created.contains(id);
                    if !live || !archived.insert(id) {
                        return Err(LedgerError::InactiveContract(id.clone()));
                    }
                }
            }
        }
        Ok(())
    }
}

fn compute_state_root(active: &BTreeMap<ContractId, Contract>) -> Digest32 {
    let leaves = active
        .values()
        .map(|contract| {
            let mut hasher = Sha256::new();
            hasher.update(b"contract");
            hasher.update(contract.id.as_str().as_bytes());
            hasher.update(contract.template.as_bytes());
            hasher.update(contract.owner.as_bytes());
            hasher.update(serde_json::to_vec(&contract.fields).unwrap_or_default());
            hasher.finalize().into()
        })
        .collect();
    build_merkle(leaves)
}

fn build_merkle(mut leaves: Vec<Digest32>) -> Digest32 {
    if leaves.is_empty() {
        return Sha256::digest(b"capledger-empty").into();
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(b"node");
            hasher.update(chunk[0]);
            hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
            next.push(hasher.finalize().into());
        }
        leaves = next;
    }
    leaves[0]
}

pub(crate) mod serde_digest {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    use super::Digest32;

    pub fn serialize<S>(value: &Digest32, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Digest32, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| D::Error::custom("digest must be 32 bytes"))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        use super::Digest32;

        pub fn serialize<S>(value: &Option<Digest32>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(digest) => super::serialize(digest, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Digest32>, D::Error>
        where
            D: Deserializer<'de>,
        {
            #[derive(Deserialize)]
            struct Wrapped(#[serde(with = "super")] Digest32);

            let wrapped = Option::<Wrapped>::deserialize(deserializer)?;
            Ok(wrapped.map(|Wrapped(digest)| digest))
        }
    }
}
