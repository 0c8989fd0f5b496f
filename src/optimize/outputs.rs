//! Collapsing of structurally identical outputs.

use std::collections::HashMap;

use log::debug;

use crate::intermediate::{Automaton, OutputId};

/// Collapses outputs with equal content and equal resolved successor chains
/// onto one representative, rewriting node first-output references and
/// output next references. Every node's emission sequence is unchanged.
///
/// Returns the number of references rewritten; zero means no duplicates were
/// referenced.
pub fn dedup_outputs(automaton: &mut Automaton) -> usize {
    let num_outputs = automaton.num_outputs();
    let mut canonical: Vec<Option<OutputId>> = vec![None; num_outputs];
    let mut interned: HashMap<(Vec<u8>, Option<OutputId>), OutputId> = HashMap::new();

    // resolve chains bottom-up; the reference structure is acyclic
    for id in automaton.output_ids() {
        let mut stack = vec![id];
        while let Some(&top) = stack.last() {
            if canonical[top.index()].is_some() {
                stack.pop();
                continue;
            }
            match automaton[top].next {
                Some(next) if canonical[next.index()].is_none() => stack.push(next),
                next => {
                    let resolved_next = next.map(|n| canonical[n.index()].unwrap());
                    let key = (automaton[top].content.clone(), resolved_next);
                    let representative = *interned.entry(key).or_insert(top);
                    canonical[top.index()] = Some(representative);
                    stack.pop();
                }
            }
        }
    }

    let mut rewritten = 0;
    for id in automaton.node_ids().collect::<Vec<_>>() {
        if let Some(first) = automaton[id].first_output {
            let representative = canonical[first.index()].unwrap();
            if representative != first {
                automaton[id].first_output = Some(representative);
                rewritten += 1;
            }
        }
    }
    for id in automaton.output_ids().collect::<Vec<_>>() {
        if let Some(next) = automaton[id].next {
            let representative = canonical[next.index()].unwrap();
            if representative != next {
                automaton[id].next = Some(representative);
                rewritten += 1;
            }
        }
    }
    debug!("output deduplication rewrote {} references", rewritten);
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate::interpret::collect_outputs;
    use crate::intermediate::Edge;

    #[test]
    fn identical_chains_collapse() {
        let mut automaton = Automaton::new();
        let start = automaton.start();
        let a = automaton.add_node();
        let b = automaton.add_node();
        let tail1 = automaton.add_output(b"tail".to_vec(), None);
        let tail2 = automaton.add_output(b"tail".to_vec(), None);
        let head1 = automaton.add_output(b"head".to_vec(), Some(tail1));
        let head2 = automaton.add_output(b"head".to_vec(), Some(tail2));
        automaton[a].first_output = Some(head1);
        automaton[b].first_output = Some(head2);
        automaton[start].edges.push(Edge::single(a, true, b'a'));
        automaton[start].edges.push(Edge::single(b, true, b'b'));

        let before_a = collect_outputs(&automaton, b"a").unwrap();
        let before_b = collect_outputs(&automaton, b"b").unwrap();
        let rewritten = dedup_outputs(&mut automaton);
        assert!(rewritten > 0);
        assert_eq!(automaton[a].first_output, automaton[b].first_output);
        assert_eq!(collect_outputs(&automaton, b"a").unwrap(), before_a);
        assert_eq!(collect_outputs(&automaton, b"b").unwrap(), before_b);
    }

    #[test]
    fn distinct_chains_are_kept() {
        let mut automaton = Automaton::new();
        let a = automaton.add_node();
        let b = automaton.add_node();
        let tail = automaton.add_output(b"tail".to_vec(), None);
        let with_tail = automaton.add_output(b"head".to_vec(), Some(tail));
        let without_tail = automaton.add_output(b"head".to_vec(), None);
        automaton[a].first_output = Some(with_tail);
        automaton[b].first_output = Some(without_tail);

        assert_eq!(dedup_outputs(&mut automaton), 0);
        assert_ne!(automaton[a].first_output, automaton[b].first_output);
    }
}
