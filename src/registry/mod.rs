//! Capability registry: contract creation, reference coercion, view
//! resolution and interface choice dispatch over one [`LedgerState`].
//!
//! A [`Registry`] owns a frozen [`Catalog`]; conformance cannot change after
//! construction. Every mutating operation commits exactly one ledger
//! transaction or fails without touching state.

use std::collections::btree_map;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contracts::{
    Catalog, ChoiceError, ChoiceImpl, Conformance, Contract, Fields, Interface, NewContract,
    Template, View,
};
use crate::ledger::{LedgerError, LedgerMutation, LedgerSnapshot, LedgerState, TransactionReceipt};
use crate::refs::{ContractId, ContractRef, InterfaceId, InterfaceRef, Party, TemplateId, TemplateRef};

/// The addressed type does not implement the requested interface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{from} does not implement {target}")]
pub struct ConformanceError {
    /// Template or interface the reference was addressed through.
    pub from: String,
    pub target: InterfaceId,
}

/// The caller is not the controller named by the contract's view.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{caller} is not the controller of {contract} (controller: {controller})")]
pub struct AuthorizationError {
    pub contract: ContractId,
    pub caller: Party,
    pub controller: Party,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Conformance(#[from] ConformanceError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("contract {0} is not active")]
    ContractNotActive(ContractId),
    #[error("unknown template {0}")]
    UnknownTemplate(TemplateId),
    #[error("unknown interface {0}")]
    UnknownInterface(InterfaceId),
    #[error("interface {interface} has no choice {choice}")]
    UnknownChoice { interface: InterfaceId, choice: String },
    #[error("invalid payload for {template}: {reason}")]
    InvalidPayload { template: TemplateId, reason: String },
    #[error("view of {contract} through {interface} is invalid: {reason}")]
    InvalidView {
        contract: ContractId,
        interface: InterfaceId,
        reason: String,
    },
    #[error("choice {choice} rejected: {source}")]
    Choice {
        choice: String,
        #[source]
        source: ChoiceError,
    },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type Result<T, E = RegistryError> = std::result::Result<T, E>;

/// Result of a choice invocation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Exercised {
    pub value: Value,
    /// Contract archived by a consuming choice.
    pub archived: Option<ContractId>,
    /// Successor contracts. Tagged with the invoked interface when the
    /// successor's template implements it.
    pub created: Vec<ContractRef>,
}

impl Exercised {
    /// First successor addressed through the invoked interface.
    pub fn successor(&self) -> Option<&InterfaceRef> {
        self.created.iter().find_map(|r| match r {
            ContractRef::Interface(r) => Some(r),
            ContractRef::Template(_) => None,
        })
    }
}

pub struct Registry {
    catalog: Arc<Catalog>,
    ledger: LedgerState,
    seed: u64,
}

impl Registry {
    /// `seed` feeds contract id derivation; equal seeds and equal operation
    /// sequences yield equal ids.
    pub fn new(catalog: Catalog, seed: u64) -> Self {
        Self {
            catalog: Arc::new(catalog),
            ledger: LedgerState::new(),
            seed,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn ledger(&self) -> &LedgerState {
        &self.ledger
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.ledger.snapshot()
    }

    pub fn receipts(&self) -> &[TransactionReceipt] {
        self.ledger.receipts()
    }

    pub fn create(&mut self, template: &str, fields: Fields, owner: &str) -> Result<TemplateRef> {
        let catalog = Arc::clone(&self.catalog);
        let def = catalog
            .template(template)
            .ok_or_else(|| RegistryError::UnknownTemplate(template.to_string()))?;
        check_payload(def, &fields)?;
        let contract = Contract {
            id: self.next_id(0, template),
            template: template.to_string(),
            owner: owner.to_string(),
            fields,
        };
        let reference = TemplateRef::new(contract.id.clone(), template);
        let receipt = self
            .ledger
            .apply_transaction(&[LedgerMutation::Create { contract }])?;
        info!(
            contract = %reference,
            template,
            owner,
            height = receipt.height,
            "contract created"
        );
        Ok(reference)
    }

    /// Live contract behind a template reference, if its template matches.
    pub fn lookup(&self, reference: &TemplateRef) -> Option<&Contract> {
        self.ledger
            .active(&reference.id)
            .filter(|c| c.template == reference.template)
    }

    /// Checked upcast. Template references need a conformance declaration;
    /// interface references need the source interface to be `interface` or
    /// to require it.
    pub fn to_interface_ref(
        &self,
        reference: impl Into<ContractRef>,
        interface: &str,
    ) -> Result<InterfaceRef> {
        if self.catalog.interface(interface).is_none() {
            return Err(RegistryError::UnknownInterface(interface.to_string()));
        }
        match reference.into() {
            ContractRef::Template(r) => {
                if self.catalog.template(&r.template).is_none() {
                    return Err(RegistryError::UnknownTemplate(r.template));
                }
                if !self.catalog.conforms(&r.template, interface) {
                    return Err(ConformanceError {
                        from: r.template,
                        target: interface.to_string(),
                    }
                    .into());
                }
                Ok(InterfaceRef::new(r.id, interface))
            }
            ContractRef::Interface(r) => {
                if !self.catalog.reaches(&r.interface, interface) {
                    return Err(ConformanceError {
                        from: r.interface,
                        target: interface.to_string(),
                    }
                    .into());
                }
                Ok(InterfaceRef::new(r.id, interface))
            }
        }
    }

    /// Downcast. `Some` iff the contract was created with `template`, even if
    /// it has since been archived.
    pub fn from_interface_ref(&self, reference: &InterfaceRef, template: &str) -> Option<TemplateRef> {
        self.ledger
            .template_of(&reference.id)
            .filter(|t| t.as_str() == template)
            .map(|t| TemplateRef::new(reference.id.clone(), t.clone()))
    }

    /// `Ok(None)` for archived or unknown contracts. A live contract whose
    /// template does not implement the reference's interface (an unchecked
    /// coercion gone wrong) is a conformance error.
    pub fn resolve_view(&self, reference: &InterfaceRef) -> Result<Option<View>> {
        let Some(contract) = self.ledger.active(&reference.id) else {
            return Ok(None);
        };
        let (interface, conformance) = self.binding(contract, &reference.interface)?;
        let (view, _) = checked_view(interface, conformance, contract)?;
        Ok(Some(view))
    }

    pub fn invoke(
        &mut self,
        reference: &InterfaceRef,
        choice: &str,
        args: &Value,
        caller: &str,
    ) -> Result<Exercised> {
        let catalog = Arc::clone(&self.catalog);
        let interface_def = catalog
            .interface(&reference.interface)
            .ok_or_else(|| RegistryError::UnknownInterface(reference.interface.clone()))?;
        if interface_def.choice_decl(choice).is_none() {
            return Err(RegistryError::UnknownChoice {
                interface: reference.interface.clone(),
                choice: choice.to_string(),
            });
        }
        let contract = self
            .ledger
            .active(&reference.id)
            .ok_or_else(|| RegistryError::ContractNotActive(reference.id.clone()))?
            .clone();
        let (interface, conformance) = bind(&catalog, &contract, &reference.interface)?;
        let (_, controller) = checked_view(interface, conformance, &contract)?;
        if controller != caller {
            warn!(contract = %reference, caller, %controller, choice, "unauthorized invoke");
            return Err(AuthorizationError {
                contract: contract.id.clone(),
                caller: caller.to_string(),
                controller,
            }
            .into());
        }

        let choice_failed = |source| RegistryError::Choice {
            choice: choice.to_string(),
            source,
        };
        match conformance.choice(choice) {
            Some(ChoiceImpl::NonConsuming(body)) => {
                let value = body(&contract, args).map_err(choice_failed)?;
                info!(contract = %reference, choice, result = %value, "choice exercised");
                Ok(Exercised {
                    value,
                    archived: None,
                    created: Vec::new(),
                })
            }
            Some(ChoiceImpl::Consuming(body)) => {
                let outcome = body(&contract, args).map_err(choice_failed)?;
                let mut mutations = vec![LedgerMutation::Archive {
                    id: contract.id.clone(),
                }];
                let mut created = Vec::with_capacity(outcome.create.len());
                for (index, successor) in outcome.create.into_iter().enumerate() {
                    let successor = self.materialize(&catalog, index as u32, successor)?;
                    let id = successor.id.clone();
                    created.push(if catalog.conforms(&successor.template, &reference.interface) {
                        ContractRef::from(InterfaceRef::new(id, reference.interface.clone()))
                    } else {
                        ContractRef::from(TemplateRef::new(id, successor.template.clone()))
                    });
                    mutations.push(LedgerMutation::Create {
                        contract: successor,
                    });
                }
                let receipt = self.ledger.apply_transaction(&mutations)?;
                info!(
                    contract = %reference,
                    choice,
                    successors = created.len(),
                    height = receipt.height,
                    "consuming choice exercised"
                );
                Ok(Exercised {
                    value: outcome.value,
                    archived: Some(contract.id),
                    created,
                })
            }
            None => Err(RegistryError::UnknownChoice {
                interface: reference.interface.clone(),
                choice: choice.to_string(),
            }),
        }
    }

    /// Live contracts owned by `actor` whose template implements `interface`.
    /// Views are computed as the iterator advances; clone it to restart. A view
    /// that fails to resolve is yielded as the error, next to its reference.
    pub fn query_by_interface<'a>(
        &'a self,
        interface: &str,
        actor: &str,
    ) -> Result<InterfaceQuery<'a>> {
        if self.catalog.interface(interface).is_none() {
            return Err(RegistryError::UnknownInterface(interface.to_string()));
        }
        Ok(InterfaceQuery {
            registry: self,
            contracts: self.ledger.active_contracts(),
            interface: interface.to_string(),
            actor: actor.to_string(),
        })
    }

    fn binding<'c>(
        &'c self,
        contract: &Contract,
        interface: &str,
    ) -> Result<(&'c Interface, &'c Conformance)> {
        bind(&self.catalog, contract, interface)
    }

    fn materialize(&self, catalog: &Catalog, index: u32, successor: NewContract) -> Result<Contract> {
        let def = catalog
            .template(&successor.template)
            .ok_or_else(|| RegistryError::UnknownTemplate(successor.template.clone()))?;
        check_payload(def, &successor.fields)?;
        Ok(Contract {
            id: self.next_id(index, &successor.template),
            template: successor.template,
            owner: successor.owner,
            fields: successor.fields,
        })
    }

    fn next_id(&self, index: u32, template: &str) -> ContractId {
        let id = ContractId::derive(self.seed, self.ledger.meta.height + 1, index, template);
        debug!(%id, template, index, "derived contract id");
        id
    }
}

fn bind<'c>(
    catalog: &'c Catalog,
    contract: &Contract,
    interface: &str,
) -> Result<(&'c Interface, &'c Conformance)> {
    let interface_def = catalog
        .interface(interface)
        .ok_or_else(|| RegistryError::UnknownInterface(interface.to_string()))?;
    let conformance = catalog
        .conformance(&contract.template, interface)
        .ok_or_else(|| ConformanceError {
            from: contract.template.clone(),
            target: interface.to_string(),
        })?;
    Ok((interface_def, conformance))
}

fn check_payload(template: &Template, fields: &Fields) -> Result<()> {
    if let Some(missing) = template.fields.iter().find(|f| !fields.contains_key(*f)) {
        return Err(RegistryError::InvalidPayload {
            template: template.id.clone(),
            reason: format!("missing field {missing}"),
        });
    }
    Ok(())
}

/// Computes the view and extracts its controller.
fn checked_view(
    interface: &Interface,
    conformance: &Conformance,
    contract: &Contract,
) -> Result<(View, Party)> {
    let invalid = |reason: String| RegistryError::InvalidView {
        contract: contract.id.clone(),
        interface: interface.id.clone(),
        reason,
    };
    let view = conformance.view(contract);
    if let Some(missing) = interface.view_fields.iter().find(|f| !view.contains_key(*f)) {
        return Err(invalid(format!("missing field {missing}")));
    }
    let controller = view
        .get(&interface.controller_field)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(format!("{} is not a party", interface.controller_field)))?
        .to_string();
    Ok((view, controller))
}

/// Lazy query over a borrowed registry. Cloning yields an independent
/// iterator positioned at the same point.
#[derive(Clone)]
pub struct InterfaceQuery<'a> {
    registry: &'a Registry,
    contracts: btree_map::Values<'a, ContractId, Contract>,
    interface: InterfaceId,
    actor: Party,
}

impl<'a> Iterator for InterfaceQuery<'a> {
    type Item = (InterfaceRef, Result<Option<View>>);

    fn next(&mut self) -> Option<Self::Item> {
        for contract in self.contracts.by_ref() {
            if contract.owner != self.actor
                || !self.registry.catalog.conforms(&contract.template, &self.interface)
            {
                continue;
            }
            let reference = InterfaceRef::new(contract.id.clone(), self.interface.clone());
            let view = self.registry.resolve_view(&reference);
            if let Err(err) = &view {
                warn!(contract = %reference, error = %err, "view resolution failed");
            }
            return Some((reference, view));
        }
        None
    }
}

/// Registry handle for concurrent callers. Each call holds the lock for its
/// whole duration, so operations are linearized.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
        }
    }

    pub fn create(&self, template: &str, fields: Fields, owner: &str) -> Result<TemplateRef> {
        self.inner.lock().create(template, fields, owner)
    }

    pub fn to_interface_ref(
        &self,
        reference: impl Into<ContractRef>,
        interface: &str,
    ) -> Result<InterfaceRef> {
        self.inner.lock().to_interface_ref(reference, interface)
    }

    pub fn from_interface_ref(&self, reference: &InterfaceRef, template: &str) -> Option<TemplateRef> {
        self.inner.lock().from_interface_ref(reference, template)
    }

    pub fn resolve_view(&self, reference: &InterfaceRef) -> Result<Option<View>> {
        self.inner.lock().resolve_view(reference)
    }

    pub fn invoke(
        &self,
        reference: &InterfaceRef,
        choice: &str,
        args: &Value,
        caller: &str,
    ) -> Result<Exercised> {
        self.inner.lock().invoke(reference, choice, args, caller)
    }

    /// Enumerates matching ids now and resolves each view when reached, taking
    /// the lock per step. Entities archived in between yield `Ok(None)`.
    pub fn query_by_interface(&self, interface: &str, actor: &str) -> Result<SharedQuery> {
        let ids = self
            .inner
            .lock()
            .query_by_interface(interface, actor)?
            .map(|(reference, _)| reference)
            .collect();
        Ok(SharedQuery {
            registry: self.clone(),
            refs: ids,
            position: 0,
        })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        self.inner.lock().snapshot()
    }
}

#[derive(Clone)]
pub struct SharedQuery {
    registry: SharedRegistry,
    refs: Vec<InterfaceRef>,
    position: usize,
}

impl SharedQuery {
    pub fn restart(&mut self) {
        self.position = 0;
    }
}

impl Iterator for SharedQuery {
    type Item = (InterfaceRef, Result<Option<View>>);

    fn next(&mut self) -> Option<Self::Item> {
        let reference = self.refs.get(self.position)?.clone();
        self.position += 1;
        let view = self.registry.resolve_view(&reference);
        Some((reference, view))
    }
}
