use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::refs::{ContractId, InterfaceId, Party, TemplateId};

pub type ChoiceName = String;

/// Payload of a contract. Always a JSON object.
pub type Fields = serde_json::Map<String, Value>;

/// Projection of a contract through one interface.
pub type View = serde_json::Map<String, Value>;

/// A live or archived contract instance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    pub id: ContractId,
    pub template: TemplateId,
    pub owner: Party,
    pub fields: Fields,
}

/// Entity type: a named record shape.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Template {
    pub id: TemplateId,
    /// Payload fields every instance must carry.
    pub fields: Vec<String>,
}

impl Template {
    pub fn new(id: impl Into<TemplateId>, fields: &[&str]) -> Self {
        Self {
            id: id.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceKind {
    Consuming,
    NonConsuming,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChoiceDecl {
    pub name: ChoiceName,
    pub kind: ChoiceKind,
}

/// Capability descriptor: view shape, controller and the choices implementors
/// must provide.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Interface {
    pub id: InterfaceId,
    pub view_fields: Vec<String>,
    /// View field holding the party allowed to exercise choices.
    pub controller_field: String,
    /// Interfaces every implementor must also implement.
    pub requires: Vec<InterfaceId>,
    pub choices: Vec<ChoiceDecl>,
}

impl Interface {
    pub fn new(id: impl Into<InterfaceId>, view_fields: &[&str], controller_field: &str) -> Self {
        Self {
            id: id.into(),
            view_fields: view_fields.iter().map(|f| f.to_string()).collect(),
            controller_field: controller_field.to_string(),
            requires: Vec::new(),
            choices: Vec::new(),
        }
    }

    pub fn requires(mut self, interface: impl Into<InterfaceId>) -> Self {
        self.requires.push(interface.into());
        self
    }

    pub fn choice(mut self, name: impl Into<ChoiceName>, kind: ChoiceKind) -> Self {
        self.choices.push(ChoiceDecl {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn choice_decl(&self, name: &str) -> Option<&ChoiceDecl> {
        self.choices.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ChoiceError(pub String);

/// Contract to be created by a consuming choice.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NewContract {
    pub template: TemplateId,
    pub owner: Party,
    pub fields: Fields,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConsumingOutcome {
    pub value: Value,
    pub create: Vec<NewContract>,
}

pub type ViewFn = Arc<dyn Fn(&Contract) -> View + Send + Sync>;
pub type QueryFn = Arc<dyn Fn(&Contract, &Value) -> Result<Value, ChoiceError> + Send + Sync>;
pub type UpdateFn =
    Arc<dyn Fn(&Contract, &Value) -> Result<ConsumingOutcome, ChoiceError> + Send + Sync>;

#[derive(Clone)]
pub enum ChoiceImpl {
    NonConsuming(QueryFn),
    Consuming(UpdateFn),
}

impl ChoiceImpl {
    pub fn non_consuming<F>(f: F) -> Self
    where
        F: Fn(&Contract, &Value) -> Result<Value, ChoiceError> + Send + Sync + 'static,
    {
        ChoiceImpl::NonConsuming(Arc::new(f))
    }

    pub fn consuming<F>(f: F) -> Self
    where
        F: Fn(&Contract, &Value) -> Result<ConsumingOutcome, ChoiceError> + Send + Sync + 'static,
    {
        ChoiceImpl::Consuming(Arc::new(f))
    }

    pub fn kind(&self) -> ChoiceKind {
        match self {
            ChoiceImpl::NonConsuming(_) => ChoiceKind::NonConsuming,
            ChoiceImpl::Consuming(_) => ChoiceKind::Consuming,
        }
    }
}

impl fmt::Debug for ChoiceImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChoiceImpl({:?})", self.kind())
    }
}

/// `template` implements `interface`.
#[derive(Clone)]
pub struct Conformance {
    pub template: TemplateId,
    pub interface: InterfaceId,
    view: ViewFn,
    choices: BTreeMap<ChoiceName, ChoiceImpl>,
}

impl Conformance {
    pub fn view(&self, contract: &Contract) -> View {
        (self.view)(contract)
    }

    pub fn choice(&self, name: &str) -> Option<&ChoiceImpl> {
        self.choices.get(name)
    }
}

impl fmt::Debug for Conformance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conformance")
            .field("template", &self.template)
            .field("interface", &self.interface)
            .field("choices", &self.choices.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
    #[error("template {0} already defined")]
    DuplicateTemplate(TemplateId),
    #[error("interface {0} already defined")]
    DuplicateInterface(InterfaceId),
    #[error("unknown template {0}")]
    UnknownTemplate(TemplateId),
    #[error("unknown interface {0}")]
    UnknownInterface(InterfaceId),
    #[error("interface {interface} requires undefined interface {required}")]
    UnknownRequiredInterface {
        interface: InterfaceId,
        required: InterfaceId,
    },
    #[error("interface {interface} declares choice {choice} twice")]
    DuplicateChoice {
        interface: InterfaceId,
        choice: ChoiceName,
    },
    #[error("interface {interface}: controller field {field} is not a view field")]
    ControllerNotInView {
        interface: InterfaceId,
        field: String,
    },
    #[error("template {template} already implements {interface}")]
    DuplicateConformance {
        template: TemplateId,
        interface: InterfaceId,
    },
    #[error("template {template} implements {interface} but not its required interface {required}")]
    MissingRequiredConformance {
        template: TemplateId,
        interface: InterfaceId,
        required: InterfaceId,
    },
    #[error("template {template} lacks an implementation of {interface}.{choice}")]
    MissingChoiceImpl {
        template: TemplateId,
        interface: InterfaceId,
        choice: ChoiceName,
    },
    #[error("template {template} implements {choice}, which {interface} does not declare")]
    UnexpectedChoiceImpl {
        template: TemplateId,
        interface: InterfaceId,
        choice: ChoiceName,
    },
    #[error("template {template} implements {interface}.{choice} more than once")]
    DuplicateChoiceImpl {
        template: TemplateId,
        interface: InterfaceId,
        choice: ChoiceName,
    },
    #[error("{interface}.{choice} is declared {declared:?} but implemented {implemented:?}")]
    ChoiceKindMismatch {
        interface: InterfaceId,
        choice: ChoiceName,
        declared: ChoiceKind,
        implemented: ChoiceKind,
    },
}

#[derive(Clone, Debug)]
struct InterfaceEntry {
    decl: Interface,
    /// Transitive closure of `decl.requires`.
    closure: BTreeSet<InterfaceId>,
}

/// Accumulates type definitions. Frozen into a [`Catalog`] by [`CatalogBuilder::build`].
#[derive(Default)]
pub struct CatalogBuilder {
    catalog: Catalog,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn template(&mut self, template: Template) -> Result<(), DefinitionError> {
        if self.catalog.templates.contains_key(&template.id) {
            return Err(DefinitionError::DuplicateTemplate(template.id));
        }
        self.catalog.templates.insert(template.id.clone(), template);
        Ok(())
    }

    /// Registers an interface. Required interfaces must be registered first,
    /// which keeps the `requires` graph acyclic.
    pub fn interface(&mut self, interface: Interface) -> Result<(), DefinitionError> {
        if self.catalog.interfaces.contains_key(&interface.id) {
            return Err(DefinitionError::DuplicateInterface(interface.id));
        }
        if !interface.view_fields.contains(&interface.controller_field) {
            return Err(DefinitionError::ControllerNotInView {
                interface: interface.id.clone(),
                field: interface.controller_field.clone(),
            });
        }
        let mut seen = BTreeSet::new();
        for choice in &interface.choices {
            if !seen.insert(choice.name.as_str()) {
                return Err(DefinitionError::DuplicateChoice {
                    interface: interface.id.clone(),
                    choice: choice.name.clone(),
                });
            }
        }
        let mut closure = BTreeSet::new();
        for required in &interface.requires {
            let entry = self.catalog.interfaces.get(required).ok_or_else(|| {
                DefinitionError::UnknownRequiredInterface {
                    interface: interface.id.clone(),
                    required: required.clone(),
                }
            })?;
            closure.insert(required.clone());
            closure.extend(entry.closure.iter().cloned());
        }
        self.catalog.interfaces.insert(
            interface.id.clone(),
            InterfaceEntry {
                decl: interface,
                closure,
            },
        );
        Ok(())
    }

    /// Declares that `template` implements `interface`. Every interface the
    /// target requires, directly or transitively, must already be implemented.
    pub fn implement<V>(
        &mut self,
        template: &str,
        interface: &str,
        view: V,
        choices: Vec<(&str, ChoiceImpl)>,
    ) -> Result<(), DefinitionError>
    where
        V: Fn(&Contract) -> View + Send + Sync + 'static,
    {
        if !self.catalog.templates.contains_key(template) {
            return Err(DefinitionError::UnknownTemplate(template.to_string()));
        }
        let entry = self
            .catalog
            .interfaces
            .get(interface)
            .ok_or_else(|| DefinitionError::UnknownInterface(interface.to_string()))?;
        let key = (template.to_string(), interface.to_string());
        if self.catalog.conformances.contains_key(&key) {
            return Err(DefinitionError::DuplicateConformance {
                template: key.0,
                interface: key.1,
            });
        }
        for required in &entry.closure {
            if !self.catalog.conforms(template, required) {
                return Err(DefinitionError::MissingRequiredConformance {
                    template: template.to_string(),
                    interface: interface.to_string(),
                    required: required.clone(),
                });
            }
        }

        let mut impls: BTreeMap<ChoiceName, ChoiceImpl> = BTreeMap::new();
        for (name, choice) in choices {
            let decl = entry.decl.choice_decl(name).ok_or_else(|| {
                DefinitionError::UnexpectedChoiceImpl {
                    template: template.to_string(),
                    interface: interface.to_string(),
                    choice: name.to_string(),
                }
            })?;
            if decl.kind != choice.kind() {
                return Err(DefinitionError::ChoiceKindMismatch {
                    interface: interface.to_string(),
                    choice: name.to_string(),
                    declared: decl.kind,
                    implemented: choice.kind(),
                });
            }
            if impls.insert(name.to_string(), choice).is_some() {
                return Err(DefinitionError::DuplicateChoiceImpl {
                    template: template.to_string(),
                    interface: interface.to_string(),
                    choice: name.to_string(),
                });
            }
        }
        if let Some(missing) = entry
            .decl
            .choices
            .iter()
            .find(|decl| !impls.contains_key(&decl.name))
        {
            return Err(DefinitionError::MissingChoiceImpl {
                template: template.to_string(),
                interface: interface.to_string(),
                choice: missing.name.clone(),
            });
        }

        self.catalog.conformances.insert(
            key.clone(),
            Conformance {
                template: key.0,
                interface: key.1,
                view: Arc::new(view),
                choices: impls,
            },
        );
        Ok(())
    }

    pub fn build(self) -> Catalog {
        self.catalog
    }
}

/// Frozen set of templates, interfaces and conformance declarations.
#[derive(Clone, Default)]
pub struct Catalog {
    templates: BTreeMap<TemplateId, Template>,
    interfaces: BTreeMap<InterfaceId, InterfaceEntry>,
    conformances: BTreeMap<(TemplateId, InterfaceId), Conformance>,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::new()
    }

    pub fn template(&self, id: &str) -> Option<&Template> {
        self.templates.get(id)
    }

    pub fn interface(&self, id: &str) -> Option<&Interface> {
        self.interfaces.get(id).map(|entry| &entry.decl)
    }

    pub fn conformance(&self, template: &str, interface: &str) -> Option<&Conformance> {
        self.conformances
            .get(&(template.to_string(), interface.to_string()))
    }

    pub fn conforms(&self, template: &str, interface: &str) -> bool {
        self.conformance(template, interface).is_some()
    }

    /// True when `interface` is `target` or requires it transitively.
    pub fn reaches(&self, interface: &str, target: &str) -> bool {
        interface == target
            || self
                .interfaces
                .get(interface)
                .is_some_and(|entry| entry.closure.contains(target))
    }

    pub fn implementors<'a>(&'a self, interface: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.conformances
            .keys()
            .filter(move |(_, i)| i == interface)
            .map(|(t, _)| t.as_str())
    }

    pub fn describe(&self) -> CatalogDescription {
        CatalogDescription {
            templates: self.templates.values().cloned().collect(),
            interfaces: self
                .interfaces
                .values()
                .map(|entry| InterfaceDescription {
                    interface: entry.decl.clone(),
                    requires_transitively: entry.closure.iter().cloned().collect(),
                })
                .collect(),
            conformances: self
                .conformances
                .keys()
                .map(|(template, interface)| ConformanceDescription {
                    template: template.clone(),
                    interface: interface.clone(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("templates", &self.templates.keys().collect::<Vec<_>>())
            .field("interfaces", &self.interfaces.keys().collect::<Vec<_>>())
            .field("conformances", &self.conformances.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogDescription {
    pub templates: Vec<Template>,
    pub interfaces: Vec<InterfaceDescription>,
    pub conformances: Vec<ConformanceDescription>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceDescription {
    #[serde(flatten)]
    pub interface: Interface,
    pub requires_transitively: Vec<InterfaceId>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConformanceDescription {
    pub template: TemplateId,
    pub interface: InterfaceId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner_view(contract: &Contract) -> View {
        let mut view = View::new();
        view.insert("owner".into(), json!(contract.owner));
        view
    }

    fn noop() -> ChoiceImpl {
        ChoiceImpl::non_consuming(|_, _| Ok(Value::Null))
    }

    fn base_builder() -> CatalogBuilder {
        let mut builder = Catalog::builder();
        builder.template(Template::new("Cat", &["name"])).unwrap();
        builder
            .interface(Interface::new("Owned", &["owner"], "owner"))
            .unwrap();
        builder
            .interface(
                Interface::new("Pet", &["owner"], "owner")
                    .requires("Owned")
                    .choice("Pat", ChoiceKind::NonConsuming),
            )
            .unwrap();
        builder
            .interface(Interface::new("Show", &["owner"], "owner").requires("Pet"))
            .unwrap();
        builder
    }

    #[test]
    fn requires_closure_is_transitive() {
        let catalog = base_builder().build();
        assert!(catalog.reaches("Show", "Pet"));
        assert!(catalog.reaches("Show", "Owned"));
        assert!(catalog.reaches("Pet", "Pet"));
        assert!(!catalog.reaches("Owned", "Pet"));
    }

    #[test]
    fn requirements_must_be_implemented_first() {
        let mut builder = base_builder();
        let err = builder
            .implement("Cat", "Pet", owner_view, vec![("Pat", noop())])
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::MissingRequiredConformance {
                template: "Cat".into(),
                interface: "Pet".into(),
                required: "Owned".into(),
            }
        );
        builder.implement("Cat", "Owned", owner_view, vec![]).unwrap();
        builder
            .implement("Cat", "Pet", owner_view, vec![("Pat", noop())])
            .unwrap();
        let catalog = builder.build();
        assert!(catalog.conforms("Cat", "Pet"));
        assert_eq!(catalog.implementors("Pet").collect::<Vec<_>>(), vec!["Cat"]);
    }

    #[test]
    fn every_declared_choice_needs_a_matching_impl() {
        let mut builder = base_builder();
        builder.implement("Cat", "Owned", owner_view, vec![]).unwrap();
        assert!(matches!(
            builder.implement("Cat", "Pet", owner_view, vec![]),
            Err(DefinitionError::MissingChoiceImpl { .. })
        ));
        let consuming = ChoiceImpl::consuming(|_, _| Ok(ConsumingOutcome::default()));
        assert!(matches!(
            builder.implement("Cat", "Pet", owner_view, vec![("Pat", consuming)]),
            Err(DefinitionError::ChoiceKindMismatch { .. })
        ));
        assert!(matches!(
            builder.implement("Cat", "Owned", owner_view, vec![]),
            Err(DefinitionError::DuplicateConformance { .. })
        ));
        assert!(matches!(
            builder.implement("Cat", "Pet", owner_view, vec![("Pat", noop()), ("Pat", noop())]),
            Err(DefinitionError::DuplicateChoiceImpl { .. })
        ));
        assert!(!builder.catalog.conforms("Cat", "Pet"));
    }

    #[test]
    fn implement_rejects_unknown_names_and_undeclared_choices() {
        let mut builder = base_builder();
        assert_eq!(
            builder.implement("Horse", "Owned", owner_view, vec![]),
            Err(DefinitionError::UnknownTemplate("Horse".into()))
        );
        assert_eq!(
            builder.implement("Cat", "Nope", owner_view, vec![]),
            Err(DefinitionError::UnknownInterface("Nope".into()))
        );
        builder.implement("Cat", "Owned", owner_view, vec![]).unwrap();
        builder
            .implement("Cat", "Pet", owner_view, vec![("Pat", noop())])
            .unwrap();
        assert_eq!(
            builder.implement("Cat", "Show", owner_view, vec![("Bogus", noop())]),
            Err(DefinitionError::UnexpectedChoiceImpl {
                template: "Cat".into(),
                interface: "Show".into(),
                choice: "Bogus".into(),
            })
        );
        builder.implement("Cat", "Show", owner_view, vec![]).unwrap();
        assert!(builder.build().conforms("Cat", "Show"));
    }

    #[test]
    fn interface_definitions_are_validated() {
        let mut builder = base_builder();
        assert_eq!(
            builder.interface(Interface::new("Loose", &["owner"], "owner").requires("Nope")),
            Err(DefinitionError::UnknownRequiredInterface {
                interface: "Loose".into(),
                required: "Nope".into(),
            })
        );
        assert!(matches!(
            builder.interface(Interface::new("Odd", &["name"], "owner")),
            Err(DefinitionError::ControllerNotInView { .. })
        ));
        assert!(matches!(
            builder.interface(
                Interface::new("Twice", &["owner"], "owner")
                    .choice("A", ChoiceKind::Consuming)
                    .choice("A", ChoiceKind::NonConsuming)
            ),
            Err(DefinitionError::DuplicateChoice { .. })
        ));
        assert!(matches!(
            builder.template(Template::new("Cat", &[])),
            Err(DefinitionError::DuplicateTemplate(_))
        ));
    }
}
