//! Property tests for reference coercion and choice authorization.

use capledger::{
    demo::{self, ANIMAL, IANIMAL, OWNED},
    ContractRef, Fields, Registry, RegistryError,
};
use proptest::prelude::*;
use serde_json::{json, Value};

const OWNERS: [&str; 3] = ["Alice", "Bob", "Carol"];

fn entity() -> impl Strategy<Value = (bool, usize, String)> {
    (any::<bool>(), 0..OWNERS.len(), "[a-z]{0,8}")
}

fn fields(name: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("name".into(), json!(name));
    fields
}

proptest! {
    /// Upcasting keeps the printed identity, and downcasting recovers the
    /// original template reference.
    #[test]
    fn prop_coercion_round_trips(entities in prop::collection::vec(entity(), 1..12), seed in any::<u64>()) {
        let mut reg = Registry::new(demo::animal_catalog().unwrap(), seed);
        for (is_cat, owner, name) in &entities {
            let template = if *is_cat { "Cat" } else { "Dog" };
            let r = reg.create(template, fields(name), OWNERS[*owner]).unwrap();
            let a = reg.to_interface_ref(r.clone(), ANIMAL).unwrap();
            prop_assert_eq!(a.to_string(), r.to_string());
            prop_assert_eq!(reg.from_interface_ref(&a, template), Some(r.clone()));
            let other = if *is_cat { "Dog" } else { "Cat" };
            prop_assert_eq!(reg.from_interface_ref(&a, other), None);
        }
    }

    /// A reference through a requiring interface upcasts to the required one.
    #[test]
    fn prop_required_interfaces_are_reachable(entities in prop::collection::vec(entity(), 1..8)) {
        let mut reg = Registry::new(demo::ianimal_catalog().unwrap(), 11);
        for (is_cat, owner, name) in &entities {
            let template = if *is_cat { "Cat" } else { "Dog" };
            let r = reg.create(template, fields(name), OWNERS[*owner]).unwrap();
            let i = reg.to_interface_ref(r.clone(), IANIMAL).unwrap();
            let o = reg.to_interface_ref(i.clone(), OWNED).unwrap();
            prop_assert_eq!(o.id.clone(), r.id.clone());
            prop_assert_eq!(ContractRef::from(o).to_string(), r.to_string());
        }
    }

    /// Only the view's controller may exercise any choice.
    #[test]
    fn prop_non_controllers_are_rejected(
        (is_cat, owner, name) in entity(),
        caller in 0..OWNERS.len(),
        consuming in any::<bool>(),
    ) {
        prop_assume!(caller != owner);
        let mut reg = Registry::new(demo::animal_catalog().unwrap(), 3);
        let template = if is_cat { "Cat" } else { "Dog" };
        let r = reg.create(template, fields(&name), OWNERS[owner]).unwrap();
        let a = reg.to_interface_ref(r.clone(), ANIMAL).unwrap();
        let (choice, args) = if consuming {
            ("AssignName", json!("Renamed"))
        } else {
            ("MakeSound", Value::Null)
        };
        let err = reg.invoke(&a, choice, &args, OWNERS[caller]).unwrap_err();
        prop_assert!(matches!(err, RegistryError::Authorization(_)));
        prop_assert!(reg.lookup(&r).is_some());
    }
}
