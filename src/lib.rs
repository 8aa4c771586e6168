//! Typed capability registry.
//!
//! Contracts are instances of templates; templates declare conformance to
//! interfaces at catalog construction time. References to a contract can be
//! addressed through its template or through any interface it implements,
//! and retagging never changes the denoted contract.
//!
//! * [`refs`]: contract ids and tagged references.
//! * [`contracts`]: templates, interfaces, conformance and the frozen catalog.
//! * [`ledger`]: live contract table, atomic transactions, receipts.
//! * [`registry`]: create, coerce, resolve, invoke and query.
//! * [`demo`]: the bundled Cat/Dog catalogs.
//! * [`config`], [`script`]: CLI plumbing.

pub mod config;
pub mod contracts;
pub mod demo;
pub mod ledger;
pub mod refs;
pub mod registry;
pub mod script;

pub use contracts::{Catalog, CatalogBuilder, ChoiceImpl, ChoiceKind, Contract, Fields, View};
pub use refs::{ContractId, ContractRef, InterfaceRef, Party, TemplateRef};
pub use registry::{
    AuthorizationError, ConformanceError, Exercised, Registry, RegistryError, SharedRegistry,
};
