use crate::forest::Forest;
use proptest::prelude::*;

const POOL: [&str; 8] = ["n0", "n1", "n2", "n3", "n4", "n5", "n6", "n7"];

#[derive(Clone, Debug)]
enum Op {
    Observe(usize),
    SetParent(usize, Option<usize>),
    Remove(usize),
    Claim(usize, usize),
    Release(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..POOL.len()).prop_map(Op::Observe),
        (0..POOL.len(), proptest::option::of(0..POOL.len()))
            .prop_map(|(child, parent)| Op::SetParent(child, parent)),
        (0..POOL.len()).prop_map(Op::Remove),
        (0..POOL.len(), 0..POOL.len()).prop_map(|(child, claimer)| Op::Claim(child, claimer)),
        (0..POOL.len()).prop_map(Op::Release),
    ]
}

fn apply(forest: &mut Forest, op: &Op) {
    match op {
        Op::Observe(name) => {
            forest.set_exists(POOL[*name]);
        }
        Op::SetParent(child, parent) => {
            // Mirrors the reconciler: only a confirmed namespace owns edges,
            // and a refused assignment leaves the forest untouched.
            if forest.exists(POOL[*child]) {
                let _ = forest.set_parent(POOL[*child], parent.map(|i| POOL[i]));
            }
        }
        Op::Remove(name) => {
            forest.remove_namespace(POOL[*name]);
        }
        Op::Claim(child, claimer) if child != claimer => {
            forest.set_required_child_of(POOL[*child], POOL[*claimer]);
        }
        Op::Claim(..) => {}
        Op::Release(name) => {
            forest.release_required_child(POOL[*name]);
        }
    }
}

proptest! {
    /// Any interleaving of observations, edge moves, removals and claims
    /// leaves the forest with consistent bidirectional edges, no cycles and
    /// no nonexistent namespace owning a parent.
    #[test]
    fn invariants_survive_arbitrary_histories(
        ops in proptest::collection::vec(arb_op(), 0..64)
    ) {
        let mut forest = Forest::default();
        for op in &ops {
            apply(&mut forest, op);
            forest.check_invariants();
        }
    }

    /// Ancestor chains and descendant sets agree with each other.
    #[test]
    fn ancestry_is_symmetric(
        ops in proptest::collection::vec(arb_op(), 0..64)
    ) {
        let mut forest = Forest::default();
        for op in &ops {
            apply(&mut forest, op);
        }
        for name in POOL {
            let chain = forest.ancestors(name);
            prop_assert_eq!(chain.last().map(|s| s.as_str()), Some(name));
            for ancestor in chain.iter().take(chain.len() - 1) {
                prop_assert!(forest.is_ancestor(ancestor, name));
                prop_assert!(
                    forest.descendants(ancestor).iter().any(|d| d == name),
                    "{} missing from descendants of {}", name, ancestor
                );
            }
        }
    }
}
