//! Property tests for the derivation tree

use std::sync::Arc;

use proptest::prelude::*;

use crate::{
    CapHandle, CapRights, CapabilityRegistry, Expiry, ManualClock, SubjectId, ValidationStatus,
};

fn rights() -> impl Strategy<Value = CapRights> {
    (0u32..128).prop_map(CapRights::from_bits_truncate)
}

fn registry() -> CapabilityRegistry {
    CapabilityRegistry::new(1024, Arc::new(ManualClock::default()))
}

proptest! {
    #[test]
    fn derive_never_amplifies(root in rights(), steps in prop::collection::vec(rights(), 1..12)) {
        let reg = registry();
        let mut current = reg.mint(SubjectId(1), root, Expiry::Never, None).unwrap();
        let mut held = root;

        for requested in steps {
            match reg.derive(current, requested) {
                Ok(child) => {
                    prop_assert!(requested.is_subset_of(held));
                    prop_assert_eq!(reg.info(child).unwrap().rights, requested);
                    current = child;
                    held = requested;
                }
                Err(_) => prop_assert!(!requested.is_subset_of(held)),
            }
        }
    }

    #[test]
    fn revoke_reaches_every_descendant(
        shape in prop::collection::vec(any::<prop::sample::Index>(), 1..24)
    ) {
        let reg = registry();
        let root = reg.mint(SubjectId(1), CapRights::all(), Expiry::Never, None).unwrap();
        let mut nodes: Vec<CapHandle> = vec![root];

        // Random tree: each new node hangs off an existing one
        for pick in shape {
            let parent = nodes[pick.index(nodes.len())];
            nodes.push(reg.derive(parent, CapRights::READ).unwrap());
        }

        reg.revoke(root);
        for node in nodes {
            prop_assert_eq!(reg.validate(node, CapRights::empty()), ValidationStatus::Expired);
        }
    }

    #[test]
    fn restrict_clamps_descendants(initial in rights(), narrowed in rights()) {
        let reg = registry();
        let root = reg.mint(SubjectId(1), initial, Expiry::Never, None).unwrap();
        let child = reg.derive(root, initial).unwrap();
        let narrowed = narrowed & initial;

        reg.restrict(root, narrowed).unwrap();
        prop_assert!(reg.info(child).unwrap().rights.is_subset_of(narrowed));
    }
}
