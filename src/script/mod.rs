//! JSON operation scripts.
//!
//! A script is a list of steps replayed against one [`Registry`]. Steps can
//! bind their resulting reference to a name and can state an expectation;
//! the run stops at the first failed step or unmet expectation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::CatalogKind;
use crate::contracts::{Fields, View};
use crate::registry::{Registry, RegistryError};
use crate::refs::{ContractRef, InterfaceRef, Party};

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("step {index}: name {name} is not bound")]
    Unbound { index: usize, name: String },
    #[error("step {index}: {name} is not an interface reference")]
    NotAnInterfaceRef { index: usize, name: String },
    #[error("step {index} failed: {source}")]
    StepFailed {
        index: usize,
        #[source]
        source: RegistryError,
    },
    #[error("step {index}: expected {expected}, got {actual}")]
    Unmet {
        index: usize,
        expected: String,
        actual: String,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoerceTarget {
    Interface(String),
    Template(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Create {
        template: String,
        owner: Party,
        #[serde(default)]
        fields: Fields,
    },
    ToInterface {
        from: String,
        interface: String,
    },
    /// Unchecked retagging.
    Coerce {
        from: String,
        target: CoerceTarget,
    },
    FromInterface {
        from: String,
        template: String,
    },
    View {
        target: String,
    },
    Invoke {
        target: String,
        choice: String,
        #[serde(default)]
        args: Value,
        caller: Party,
    },
    Query {
        interface: String,
        actor: Party,
    },
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Create { .. } => "create",
            Step::ToInterface { .. } => "to_interface",
            Step::Coerce { .. } => "coerce",
            Step::FromInterface { .. } => "from_interface",
            Step::View { .. } => "view",
            Step::Invoke { .. } => "invoke",
            Step::Query { .. } => "query",
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Conformance,
    Authorization,
    NotActive,
    UnknownTemplate,
    UnknownInterface,
    UnknownChoice,
    InvalidPayload,
    InvalidView,
    Choice,
    Ledger,
}

impl ErrorKind {
    pub fn of(err: &RegistryError) -> Self {
        match err {
            RegistryError::Conformance(_) => ErrorKind::Conformance,
            RegistryError::Authorization(_) => ErrorKind::Authorization,
            RegistryError::ContractNotActive(_) => ErrorKind::NotActive,
            RegistryError::UnknownTemplate(_) => ErrorKind::UnknownTemplate,
            RegistryError::UnknownInterface(_) => ErrorKind::UnknownInterface,
            RegistryError::UnknownChoice { .. } => ErrorKind::UnknownChoice,
            RegistryError::InvalidPayload { .. } => ErrorKind::InvalidPayload,
            RegistryError::InvalidView { .. } => ErrorKind::InvalidView,
            RegistryError::Choice { .. } => ErrorKind::Choice,
            RegistryError::Ledger(_) => ErrorKind::Ledger,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// Choice result or view equals this JSON value.
    Value(Value),
    /// Resulting reference equals the one bound to this name.
    Same(String),
    /// Resulting reference differs from the one bound to this name.
    Different(String),
    /// Downcast or view lookup yields nothing.
    Absent,
    Count(usize),
    Error(ErrorKind),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScriptStep {
    #[serde(flatten)]
    pub step: Step,
    /// Name to bind the resulting reference (or first successor) to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<Expect>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Script {
    pub steps: Vec<ScriptStep>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Outcome {
    Ref(ContractRef),
    Absent,
    View(Option<View>),
    Exercised {
        value: Value,
        created: Vec<ContractRef>,
    },
    Query(Vec<(InterfaceRef, Option<View>)>),
    Rejected(String),
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StepReport {
    pub index: usize,
    pub op: &'static str,
    pub outcome: Outcome,
}

impl Script {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn run(&self, registry: &mut Registry) -> Result<Vec<StepReport>, ScriptError> {
        let mut bindings: BTreeMap<String, ContractRef> = BTreeMap::new();
        let mut reports = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            let outcome = match execute(registry, &bindings, index, &step.step)? {
                Ok(outcome) => outcome,
                Err(err) => {
                    if step.expect == Some(Expect::Error(ErrorKind::of(&err))) {
                        info!(index, op = step.step.name(), error = %err, "expected rejection");
                        reports.push(StepReport {
                            index,
                            op: step.step.name(),
                            outcome: Outcome::Rejected(err.to_string()),
                        });
                        continue;
                    }
                    warn!(index, op = step.step.name(), error = %err, "step failed");
                    return Err(ScriptError::StepFailed { index, source: err });
                }
            };
            if let Some(expect) = &step.expect {
                check(index, expect, &outcome, &bindings)?;
            }
            if let Some(name) = &step.bind {
                if let Some(reference) = bound_ref(&outcome) {
                    bindings.insert(name.clone(), reference);
                }
            }
            info!(index, op = step.step.name(), "step ok");
            reports.push(StepReport {
                index,
                op: step.step.name(),
                outcome,
            });
        }
        Ok(reports)
    }
}

/// Outer error: script-level fault. Inner error: registry rejection, which a
/// step may expect.
fn execute(
    registry: &mut Registry,
    bindings: &BTreeMap<String, ContractRef>,
    index: usize,
    step: &Step,
) -> Result<Result<Outcome, RegistryError>, ScriptError> {
    let lookup = |name: &str| {
        bindings.get(name).cloned().ok_or_else(|| ScriptError::Unbound {
            index,
            name: name.to_string(),
        })
    };
    let interface_ref = |name: &str| match lookup(name)? {
        ContractRef::Interface(r) => Ok(r),
        ContractRef::Template(_) => Err(ScriptError::NotAnInterfaceRef {
            index,
            name: name.to_string(),
        }),
    };

    let outcome = match step {
        Step::Create {
            template,
            owner,
            fields,
        } => registry
            .create(template, fields.clone(), owner)
            .map(|r| Outcome::Ref(r.into())),
        Step::ToInterface { from, interface } => registry
            .to_interface_ref(lookup(from)?, interface)
            .map(|r| Outcome::Ref(r.into())),
        Step::Coerce { from, target } => {
            let source = lookup(from)?;
            Ok(Outcome::Ref(match target {
                CoerceTarget::Interface(i) => source.coerce_interface_unchecked(i.as_str()).into(),
                CoerceTarget::Template(t) => source.coerce_template_unchecked(t.as_str()).into(),
            }))
        }
        Step::FromInterface { from, template } => {
            let source = interface_ref(from)?;
            Ok(match registry.from_interface_ref(&source, template) {
                Some(r) => Outcome::Ref(r.into()),
                None => Outcome::Absent,
            })
        }
        Step::View { target } => registry.resolve_view(&interface_ref(target)?).map(Outcome::View),
        Step::Invoke {
            target,
            choice,
            args,
            caller,
        } => registry
            .invoke(&interface_ref(target)?, choice, args, caller)
            .map(|exercised| Outcome::Exercised {
                value: exercised.value,
                created: exercised.created,
            }),
        Step::Query { interface, actor } => registry
            .query_by_interface(interface, actor)
            .and_then(|query| {
                query
                    .map(|(reference, view)| view.map(|view| (reference, view)))
                    .collect::<Result<Vec<_>, RegistryError>>()
            })
            .map(Outcome::Query),
    };
    Ok(outcome)
}

fn bound_ref(outcome: &Outcome) -> Option<ContractRef> {
    match outcome {
        Outcome::Ref(r) => Some(r.clone()),
        Outcome::Exercised { created, .. } => created.first().cloned(),
        _ => None,
    }
}

fn check(
    index: usize,
    expect: &Expect,
    outcome: &Outcome,
    bindings: &BTreeMap<String, ContractRef>,
) -> Result<(), ScriptError> {
    let actual = serde_json::to_value(outcome).unwrap_or(Value::Null);
    let met = match expect {
        Expect::Value(value) => match outcome {
            Outcome::Exercised { value: got, .. } => got == value,
            Outcome::View(Some(view)) => json!(view) == *value,
            _ => false,
        },
        Expect::Same(name) | Expect::Different(name) => {
            let bound = bindings.get(name).ok_or_else(|| ScriptError::Unbound {
                index,
                name: name.clone(),
            })?;
            let same = bound_ref(outcome).as_ref() == Some(bound);
            same == matches!(expect, Expect::Same(_))
        }
        Expect::Absent => matches!(outcome, Outcome::Absent | Outcome::View(None)),
        Expect::Count(n) => matches!(outcome, Outcome::Query(rows) if rows.len() == *n),
        Expect::Error(_) => false,
    };
    if met {
        Ok(())
    } else {
        Err(ScriptError::Unmet {
            index,
            expected: serde_json::to_string(expect).unwrap_or_default(),
            actual: actual.to_string(),
        })
    }
}

fn step(step: Step, bind: Option<&str>, expect: Option<Expect>) -> ScriptStep {
    ScriptStep {
        step,
        bind: bind.map(str::to_string),
        expect,
    }
}

fn named(name: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("name".into(), json!(name));
    fields
}

/// Canonical walkthrough for a bundled catalog.
pub fn scenario(kind: CatalogKind) -> Script {
    let steps = match kind {
        CatalogKind::Animals => vec![
            step(
                Step::Create {
                    template: "Cat".into(),
                    owner: "Alice".into(),
                    fields: named(""),
                },
                Some("c1"),
                None,
            ),
            step(
                Step::ToInterface {
                    from: "c1".into(),
                    interface: "Animal".into(),
                },
                Some("a1"),
                None,
            ),
            step(
                Step::Invoke {
                    target: "a1".into(),
                    choice: "MakeSound".into(),
                    args: Value::Null,
                    caller: "Alice".into(),
                },
                None,
                Some(Expect::Value(json!("Miaow! I am a cat belonging to Alice"))),
            ),
            step(
                Step::Invoke {
                    target: "a1".into(),
                    choice: "MakeSound".into(),
                    args: Value::Null,
                    caller: "Bob".into(),
                },
                None,
                Some(Expect::Error(ErrorKind::Authorization)),
            ),
            step(
                Step::Invoke {
                    target: "a1".into(),
                    choice: "AssignName".into(),
                    args: json!("Fluffy"),
                    caller: "Alice".into(),
                },
                Some("a2"),
                Some(Expect::Different("a1".into())),
            ),
            step(
                Step::FromInterface {
                    from: "a1".into(),
                    template: "Cat".into(),
                },
                None,
                Some(Expect::Same("c1".into())),
            ),
            step(Step::View { target: "a1".into() }, None, Some(Expect::Absent)),
            step(
                Step::Invoke {
                    target: "a1".into(),
                    choice: "AssignName".into(),
                    args: json!("Again"),
                    caller: "Alice".into(),
                },
                None,
                Some(Expect::Error(ErrorKind::NotActive)),
            ),
            step(
                Step::Invoke {
                    target: "a2".into(),
                    choice: "MakeSound".into(),
                    args: Value::Null,
                    caller: "Alice".into(),
                },
                None,
                Some(Expect::Value(json!(
                    "Miaow! I am Fluffy, a cat belonging to Alice"
                ))),
            ),
        ],
        CatalogKind::Ianimal => vec![
            step(
                Step::Create {
                    template: "Dog".into(),
                    owner: "Alice".into(),
                    fields: named("Rex"),
                },
                Some("d1"),
                None,
            ),
            step(
                Step::ToInterface {
                    from: "d1".into(),
                    interface: "IAnimal".into(),
                },
                Some("i1"),
                None,
            ),
            step(
                Step::ToInterface {
                    from: "i1".into(),
                    interface: "Owned".into(),
                },
                Some("o1"),
                None,
            ),
            step(
                Step::ToInterface {
                    from: "o1".into(),
                    interface: "IAnimal".into(),
                },
                None,
                Some(Expect::Error(ErrorKind::Conformance)),
            ),
            step(
                Step::Coerce {
                    from: "o1".into(),
                    target: CoerceTarget::Interface("IAnimal".into()),
                },
                None,
                Some(Expect::Same("i1".into())),
            ),
            step(
                Step::Invoke {
                    target: "i1".into(),
                    choice: "Speak".into(),
                    args: Value::Null,
                    caller: "Alice".into(),
                },
                None,
                Some(Expect::Value(json!("Rex says woof"))),
            ),
            step(
                Step::Create {
                    template: "Rock".into(),
                    owner: "Alice".into(),
                    fields: Fields::new(),
                },
                Some("r1"),
                None,
            ),
            step(
                Step::Coerce {
                    from: "r1".into(),
                    target: CoerceTarget::Interface("IAnimal".into()),
                },
                Some("bogus"),
                None,
            ),
            step(
                Step::View {
                    target: "bogus".into(),
                },
                None,
                Some(Expect::Error(ErrorKind::Conformance)),
            ),
            step(
                Step::Query {
                    interface: "Owned".into(),
                    actor: "Alice".into(),
                },
                None,
                Some(Expect::Count(2)),
            ),
        ],
    };
    Script { steps }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_scenarios_pass() {
        for kind in [CatalogKind::Animals, CatalogKind::Ianimal] {
            let mut registry = Registry::new(kind.build().unwrap(), 5);
            let reports = scenario(kind).run(&mut registry).unwrap();
            assert_eq!(reports.len(), scenario(kind).steps.len());
        }
    }

    #[test]
    fn scripts_parse_from_json() {
        let script = Script::from_slice(
            br#"{"steps": [
                {"op": "create", "template": "Dog", "owner": "Bob", "fields": {"name": "Rex"}, "bind": "d"},
                {"op": "to_interface", "from": "d", "interface": "Animal", "bind": "a"},
                {"op": "invoke", "target": "a", "choice": "MakeSound", "caller": "Bob",
                 "expect": {"value": "Woof! I am Rex, a dog belonging to Bob"}},
                {"op": "view", "target": "a", "expect": {"value": {"owner": "Bob", "name": "Rex"}}},
                {"op": "query", "interface": "Animal", "actor": "Alice", "expect": {"count": 0}},
                {"op": "invoke", "target": "a", "choice": "AssignName", "args": "Max", "caller": "Eve",
                 "expect": {"error": "authorization"}}
            ]}"#,
        )
        .unwrap();
        let mut registry = Registry::new(CatalogKind::Animals.build().unwrap(), 0);
        let reports = script.run(&mut registry).unwrap();
        assert!(matches!(reports[5].outcome, Outcome::Rejected(_)));
    }

    #[test]
    fn demo_script_runs_clean() {
        let script = Script::from_slice(include_bytes!("../../demos/animals.json")).unwrap();
        let mut registry = Registry::new(CatalogKind::Animals.build().unwrap(), 0);
        let reports = script.run(&mut registry).unwrap();
        assert_eq!(reports.len(), 13);
        assert_eq!(registry.receipts().len(), 3);
    }

    #[test]
    fn unmet_expectations_stop_the_run() {
        let script = Script {
            steps: vec![
                step(
                    Step::Create {
                        template: "Cat".into(),
                        owner: "Alice".into(),
                        fields: named(""),
                    },
                    Some("c"),
                    None,
                ),
                step(
                    Step::Query {
                        interface: "Animal".into(),
                        actor: "Alice".into(),
                    },
                    None,
                    Some(Expect::Count(3)),
                ),
            ],
        };
        let mut registry = Registry::new(CatalogKind::Animals.build().unwrap(), 0);
        assert!(matches!(
            script.run(&mut registry),
            Err(ScriptError::Unmet { index: 1, .. })
        ));
    }

    #[test]
    fn unbound_names_and_wrong_reference_kinds_are_reported() {
        let mut registry = Registry::new(CatalogKind::Animals.build().unwrap(), 0);
        let script = Script {
            steps: vec![step(Step::View { target: "x".into() }, None, None)],
        };
        assert!(matches!(
            script.run(&mut registry),
            Err(ScriptError::Unbound { index: 0, .. })
        ));

        let script = Script {
            steps: vec![
                step(
                    Step::Create {
                        template: "Cat".into(),
                        owner: "Alice".into(),
                        fields: named(""),
                    },
                    Some("c"),
                    None,
                ),
                step(Step::View { target: "c".into() }, None, None),
            ],
        };
        assert!(matches!(
            script.run(&mut registry),
            Err(ScriptError::NotAnInterfaceRef { index: 1, .. })
        ));
    }
}
