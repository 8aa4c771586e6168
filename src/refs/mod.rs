use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Party = String;
pub type TemplateId = String;
pub type InterfaceId = String;

/// Identity of a single contract instance. Rendered as 64 lowercase hex chars.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractId(String);

impl ContractId {
    /// Derives a fresh id for output `index` of transaction `tx_counter`.
    pub fn derive(seed: u64, tx_counter: u64, index: u32, template: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"capledger-cid");
        hasher.update(seed.to_le_bytes());
        hasher.update(tx_counter.to_le_bytes());
        hasher.update(index.to_le_bytes());
        hasher.update(template.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContractId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Reference addressed through a concrete template.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateRef {
    pub id: ContractId,
    pub template: TemplateId,
}

/// Reference addressed through an interface.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceRef {
    pub id: ContractId,
    pub interface: InterfaceId,
}

impl TemplateRef {
    pub fn new(id: ContractId, template: impl Into<TemplateId>) -> Self {
        Self {
            id,
            template: template.into(),
        }
    }
}

impl InterfaceRef {
    pub fn new(id: ContractId, interface: impl Into<InterfaceId>) -> Self {
        Self {
            id,
            interface: interface.into(),
        }
    }
}

/// Either kind of reference. The tag only changes how the contract is addressed,
/// never which contract is denoted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContractRef {
    Template(TemplateRef),
    Interface(InterfaceRef),
}

impl ContractRef {
    pub fn id(&self) -> &ContractId {
        match self {
            ContractRef::Template(r) => &r.id,
            ContractRef::Interface(r) => &r.id,
        }
    }

    /// Retags as an interface reference without checking conformance.
    ///
    /// Use only when the underlying template is known to implement `interface`
    /// by some means the registry cannot verify. A wrong guess is reported as a
    /// conformance error the first time the reference is resolved or invoked.
    pub fn coerce_interface_unchecked(self, interface: impl Into<InterfaceId>) -> InterfaceRef {
        InterfaceRef::new(self.into_id(), interface)
    }

    /// Retags as a template reference without checking the live template.
    ///
    /// Same caveats as [`ContractRef::coerce_interface_unchecked`]: prefer
    /// `Registry::from_interface_ref`, which returns `None` on a mismatch.
    pub fn coerce_template_unchecked(self, template: impl Into<TemplateId>) -> TemplateRef {
        TemplateRef::new(self.into_id(), template)
    }

    fn into_id(self) -> ContractId {
        match self {
            ContractRef::Template(r) => r.id,
            ContractRef::Interface(r) => r.id,
        }
    }
}

impl From<TemplateRef> for ContractRef {
    fn from(value: TemplateRef) -> Self {
        ContractRef::Template(value)
    }
}

impl From<InterfaceRef> for ContractRef {
    fn from(value: InterfaceRef) -> Self {
        ContractRef::Interface(value)
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

impl fmt::Display for InterfaceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id.fmt(f)
    }
}

impl fmt::Display for ContractRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.id().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_ids_are_deterministic_and_distinct() {
        let a = ContractId::derive(7, 1, 0, "Cat");
        let b = ContractId::derive(7, 1, 0, "Cat");
        let c = ContractId::derive(7, 2, 0, "Cat");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn retagging_keeps_the_printed_identity() {
        let cat = TemplateRef::new(ContractId::derive(1, 1, 0, "Cat"), "Cat");
        let animal = ContractRef::from(cat.clone()).coerce_interface_unchecked("Animal");
        assert_eq!(cat.to_string(), animal.to_string());
        let back = ContractRef::from(animal).coerce_template_unchecked("Cat");
        assert_eq!(back, cat);
    }
}
