//! Bundled example catalogs.
//!
//! * [`animal_catalog`]: `Cat` and `Dog` implement `Animal`, which exposes a
//!   non-consuming `MakeSound` and a consuming `AssignName`.
//! * [`ianimal_catalog`]: `IAnimal` requires `Owned`; `Cat` and `Dog` implement
//!   both, `Rock` only `Owned`.

use serde_json::{json, Value};

use crate::contracts::{
    Catalog, ChoiceError, ChoiceImpl, ChoiceKind, ConsumingOutcome, Contract, DefinitionError,
    Interface, NewContract, Template, View,
};

pub const ANIMAL: &str = "Animal";
pub const OWNED: &str = "Owned";
pub const IANIMAL: &str = "IAnimal";

#[derive(Clone, Copy)]
struct Species {
    template: &'static str,
    kind: &'static str,
    sound: &'static str,
}

const CAT: Species = Species {
    template: "Cat",
    kind: "cat",
    sound: "Miaow",
};

const DOG: Species = Species {
    template: "Dog",
    kind: "dog",
    sound: "Woof",
};

/// Choices need a string name; an absent name counts as unnamed.
fn name_of(contract: &Contract) -> Result<&str, ChoiceError> {
    match contract.fields.get("name") {
        None => Ok(""),
        Some(Value::String(name)) => Ok(name.as_str()),
        Some(other) => Err(ChoiceError(format!(
            "{} has a non-string name {other}",
            contract.id
        ))),
    }
}

fn make_sound(species: Species) -> ChoiceImpl {
    ChoiceImpl::non_consuming(move |contract, _| {
        let name = name_of(contract)?;
        let line = if name.is_empty() {
            format!(
                "{}! I am a {} belonging to {}",
                species.sound, species.kind, contract.owner
            )
        } else {
            format!(
                "{}! I am {name}, a {} belonging to {}",
                species.sound, species.kind, contract.owner
            )
        };
        Ok(Value::String(line))
    })
}

/// Archives the contract and recreates it under the new name.
fn rename() -> ChoiceImpl {
    ChoiceImpl::consuming(|contract, args| {
        let new_name = args
            .as_str()
            .ok_or_else(|| ChoiceError(format!("expected a name string, got {args}")))?;
        let mut fields = contract.fields.clone();
        fields.insert("name".into(), json!(new_name));
        Ok(ConsumingOutcome {
            value: Value::Null,
            create: vec![NewContract {
                template: contract.template.clone(),
                owner: contract.owner.clone(),
                fields,
            }],
        })
    })
}

/// The stored name is shown as is, whatever its JSON type.
fn animal_view(contract: &Contract) -> View {
    let mut view = View::new();
    view.insert("owner".into(), json!(contract.owner));
    let name = contract.fields.get("name").cloned().unwrap_or_else(|| json!(""));
    view.insert("name".into(), name);
    view
}

pub fn animal_catalog() -> Result<Catalog, DefinitionError> {
    let mut builder = Catalog::builder();
    builder.interface(
        Interface::new(ANIMAL, &["owner", "name"], "owner")
            .choice("MakeSound", ChoiceKind::NonConsuming)
            .choice("AssignName", ChoiceKind::Consuming),
    )?;
    for species in [CAT, DOG] {
        builder.template(Template::new(species.template, &["name"]))?;
        builder.implement(
            species.template,
            ANIMAL,
            animal_view,
            vec![("MakeSound", make_sound(species)), ("AssignName", rename())],
        )?;
    }
    Ok(builder.build())
}

fn owned_view(contract: &Contract) -> View {
    let mut view = View::new();
    view.insert("owner".into(), json!(contract.owner));
    view.insert("kind".into(), json!(contract.template));
    view
}

fn describe() -> ChoiceImpl {
    ChoiceImpl::non_consuming(|contract, _| {
        Ok(json!(format!("{} owned by {}", contract.template, contract.owner)))
    })
}

pub fn ianimal_catalog() -> Result<Catalog, DefinitionError> {
    let mut builder = Catalog::builder();
    builder.interface(
        Interface::new(OWNED, &["owner", "kind"], "owner").choice("Describe", ChoiceKind::NonConsuming),
    )?;
    builder.interface(
        Interface::new(IANIMAL, &["owner", "name", "sound"], "owner")
            .requires(OWNED)
            .choice("Speak", ChoiceKind::NonConsuming)
            .choice("Rename", ChoiceKind::Consuming),
    )?;

    builder.template(Template::new("Rock", &[]))?;
    builder.implement("Rock", OWNED, owned_view, vec![("Describe", describe())])?;

    for species in [CAT, DOG] {
        builder.template(Template::new(species.template, &["name"]))?;
        builder.implement(species.template, OWNED, owned_view, vec![("Describe", describe())])?;
        let speak = ChoiceImpl::non_consuming(move |contract, _| {
            Ok(json!(format!(
                "{} says {}",
                name_of(contract)?,
                species.sound.to_lowercase()
            )))
        });
        builder.implement(
            species.template,
            IANIMAL,
            move |contract: &Contract| {
                let mut view = animal_view(contract);
                view.insert("sound".into(), json!(species.sound));
                view
            },
            vec![("Speak", speak), ("Rename", rename())],
        )?;
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_catalogs_declare_expected_conformance() {
        let animals = animal_catalog().unwrap();
        assert!(animals.conforms("Cat", ANIMAL));
        assert!(animals.conforms("Dog", ANIMAL));

        let ianimals = ianimal_catalog().unwrap();
        assert!(ianimals.reaches(IANIMAL, OWNED));
        assert!(ianimals.conforms("Rock", OWNED));
        assert!(!ianimals.conforms("Rock", IANIMAL));
        let description = ianimals.describe();
        assert_eq!(description.conformances.len(), 5);
    }

    #[test]
    fn dog_sound_names_the_owner() {
        let catalog = animal_catalog().unwrap();
        let mut fields = crate::contracts::Fields::new();
        fields.insert("name".into(), json!(""));
        let dog = Contract {
            id: "d1".into(),
            template: "Dog".into(),
            owner: "Bob".into(),
            fields,
        };
        let conformance = catalog.conformance("Dog", ANIMAL).unwrap();
        let Some(ChoiceImpl::NonConsuming(body)) = conformance.choice("MakeSound") else {
            panic!("MakeSound must be non-consuming");
        };
        assert_eq!(
            body(&dog, &Value::Null).unwrap(),
            json!("Woof! I am a dog belonging to Bob")
        );
    }
}
