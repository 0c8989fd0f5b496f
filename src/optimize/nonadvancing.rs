//! Elimination and shortening of non-advancing transitions.
//!
//! A non-advancing transition from `A` to `B` on input `c` re-examines the
//! same byte at `B`. When `B` emits no output on entry, the transition can be
//! resolved one step ahead at rewrite time: retargeted to `B`'s successor on
//! `c`, or dropped when `B` has none.

use fixedbitset::FixedBitSet;
use log::debug;

use super::optimize_edges;
use crate::intermediate::{Automaton, Edge, NodeId, NUM_INPUTS};

/// Strategy for rewriting non-advancing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonadvancingVariant {
    /// Retargets per-input transitions, splitting a transition into several
    /// when the look-ahead target is ambiguous. May grow a node.
    Aggressive,
    /// Like aggressive, but leaves ambiguous transitions unchanged.
    Conservative,
    /// Retargets whole edges (and the default) only when every covered input
    /// agrees on one successor. Never grows the automaton.
    Structural,
}

/// Rewrites non-advancing transitions until a fixed point is reached.
///
/// Each sweep visits every node once, in the breadth-first order computed at
/// the start of that sweep; sweeps repeat while any node changes. Returns the
/// total number of modifications, zero meaning the automaton was already at
/// a fixed point.
pub fn translate_nonadvancing(automaton: &mut Automaton, variant: NonadvancingVariant) -> usize {
    let mut total = 0;
    loop {
        let order = automaton.breadth_first_order();
        let mut changed = 0;
        for id in order {
            changed += match variant {
                NonadvancingVariant::Structural => translate_structural(automaton, id),
                NonadvancingVariant::Aggressive => translate_split(automaton, id, true),
                NonadvancingVariant::Conservative => translate_split(automaton, id, false),
            };
        }
        debug!("non-advancing sweep made {} modifications", changed);
        total += changed;
        if changed == 0 {
            break;
        }
    }
    total
}

/// True if entering `id` emits nothing, either because it has no outputs or
/// because the automaton suppresses outputs on non-advancing transitions.
fn look_ahead_allowed(automaton: &Automaton, id: NodeId) -> bool {
    automaton.no_advance_no_output || automaton[id].first_output.is_none()
}

fn distinct_successors(automaton: &Automaton, id: NodeId, value: u8) -> Vec<(NodeId, bool)> {
    let mut successors = automaton.targets_for(id, value);
    successors.sort_unstable_by_key(|&(target, advance)| (target.index(), advance));
    successors.dedup();
    successors
}

fn push_unique(targets: &mut Vec<(NodeId, bool)>, pair: (NodeId, bool)) {
    if !targets.contains(&pair) {
        targets.push(pair);
    }
}

/// Per-input translation used by the aggressive and conservative variants.
/// A modified node is rebuilt from single-value edges and recompacted with
/// the edge optimizer.
fn translate_split(automaton: &mut Automaton, id: NodeId, aggressive: bool) -> usize {
    let by_input = automaton.targets_by_input(id);
    let mut new_by_input: Vec<Vec<(NodeId, bool)>> = Vec::with_capacity(NUM_INPUTS);
    let mut modifications = 0;
    for (value, targets) in by_input.iter().enumerate() {
        let mut new_targets = Vec::with_capacity(targets.len());
        for &(target, advance) in targets {
            if advance || !look_ahead_allowed(automaton, target) {
                push_unique(&mut new_targets, (target, advance));
                continue;
            }
            let successors = distinct_successors(automaton, target, value as u8);
            match successors.len() {
                // execution would terminate at the target anyway
                0 => modifications += 1,
                1 => {
                    if successors[0] == (target, advance) {
                        push_unique(&mut new_targets, (target, advance));
                    } else {
                        push_unique(&mut new_targets, successors[0]);
                        modifications += 1;
                    }
                }
                _ => {
                    if aggressive {
                        for &successor in &successors {
                            push_unique(&mut new_targets, successor);
                        }
                        modifications += 1;
                    } else {
                        push_unique(&mut new_targets, (target, advance));
                    }
                }
            }
        }
        new_by_input.push(new_targets);
    }

    if modifications > 0 {
        let node = &mut automaton[id];
        node.edges.clear();
        node.default_target = None;
        for (value, targets) in new_by_input.iter().enumerate() {
            for &(target, advance) in targets {
                automaton[id]
                    .edges
                    .push(Edge::single(target, advance, value as u8));
            }
        }
        optimize_edges(automaton, id);
    }
    modifications
}

/// The successor `(target, advance)` shared by `from` on every given input
/// value, or `None` if any input is ambiguous, dead, or disagrees.
fn common_successor(
    automaton: &Automaton,
    from: NodeId,
    values: impl Iterator<Item = u8>,
) -> Option<(NodeId, bool)> {
    let mut common = None;
    for value in values {
        let successors = distinct_successors(automaton, from, value);
        if successors.len() != 1 {
            return None;
        }
        match common {
            None => common = Some(successors[0]),
            Some(pair) if pair == successors[0] => {}
            Some(_) => return None,
        }
    }
    common
}

/// Whole-edge translation used by the structural variant. Edges keep their
/// value sets; only targets and advance flags change.
fn translate_structural(automaton: &mut Automaton, id: NodeId) -> usize {
    let mut modifications = 0;
    for position in 0..automaton[id].edges.len() {
        let (target, advance, values) = {
            let edge = &automaton[id].edges[position];
            let values: Vec<u8> = if edge.is_epsilon() {
                (0..=255).collect()
            } else {
                edge.values().collect()
            };
            (edge.target, edge.advance, values)
        };
        if advance || !look_ahead_allowed(automaton, target) {
            continue;
        }
        if let Some(successor) = common_successor(automaton, target, values.into_iter()) {
            if successor != (target, advance) {
                let edge = &mut automaton[id].edges[position];
                edge.target = successor.0;
                edge.advance = successor.1;
                modifications += 1;
            }
        }
    }

    // the default is eligible only when every input byte it covers agrees
    let node = &automaton[id];
    if let Some(default) = node.default_target {
        if !node.advance_on_default && look_ahead_allowed(automaton, default) {
            let mut covered = FixedBitSet::with_capacity(NUM_INPUTS);
            for edge in &node.edges {
                if edge.is_epsilon() {
                    covered.set_range(.., true);
                } else {
                    for value in edge.values() {
                        covered.insert(value as usize);
                    }
                }
            }
            let uncovered: Vec<u8> = (0..=255).filter(|&v| !covered.contains(v as usize)).collect();
            if !uncovered.is_empty() {
                if let Some(successor) =
                    common_successor(automaton, default, uncovered.into_iter())
                {
                    if successor != (default, false) {
                        let node = &mut automaton[id];
                        node.default_target = Some(successor.0);
                        node.advance_on_default = successor.1;
                        modifications += 1;
                    }
                }
            }
        }
    }
    modifications
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate::interpret::collect_outputs;

    /// A -> B on `c` without advancing, B -> D on `c` advancing, B silent.
    fn look_ahead_automaton() -> (Automaton, NodeId, NodeId, NodeId) {
        let mut automaton = Automaton::new();
        let a = automaton.start();
        let b = automaton.add_node();
        let d = automaton.add_node();
        let output = automaton.add_output(b"d".to_vec(), None);
        automaton[a].edges.push(Edge::single(b, false, b'c'));
        automaton[b].edges.push(Edge::single(d, true, b'c'));
        automaton[d].first_output = Some(output);
        (automaton, a, b, d)
    }

    #[test]
    fn structural_retargets_unambiguous_edge() {
        let (mut automaton, a, _, d) = look_ahead_automaton();
        let before = collect_outputs(&automaton, b"c").unwrap();
        let modifications = translate_nonadvancing(&mut automaton, NonadvancingVariant::Structural);
        assert_eq!(modifications, 1);
        assert_eq!(automaton[a].edges[0].target, d);
        assert!(automaton[a].edges[0].advance);
        assert_eq!(collect_outputs(&automaton, b"c").unwrap(), before);
    }

    #[test]
    fn aggressive_and_conservative_match_structural_here() {
        for variant in [
            NonadvancingVariant::Aggressive,
            NonadvancingVariant::Conservative,
        ] {
            let (mut automaton, a, _, d) = look_ahead_automaton();
            let before = collect_outputs(&automaton, b"c").unwrap();
            let modifications = translate_nonadvancing(&mut automaton, variant);
            assert!(modifications >= 1);
            assert_eq!(automaton.targets_for(a, b'c'), vec![(d, true)]);
            assert_eq!(collect_outputs(&automaton, b"c").unwrap(), before);
        }
    }

    #[test]
    fn output_bearing_target_blocks_look_ahead() {
        let (mut automaton, _, b, _) = look_ahead_automaton();
        let output = automaton.add_output(b"b".to_vec(), None);
        automaton[b].first_output = Some(output);
        for variant in [
            NonadvancingVariant::Aggressive,
            NonadvancingVariant::Conservative,
            NonadvancingVariant::Structural,
        ] {
            let mut candidate = automaton.clone();
            assert_eq!(translate_nonadvancing(&mut candidate, variant), 0);
        }
    }

    #[test]
    fn no_advance_no_output_reenables_look_ahead() {
        let (mut automaton, a, b, d) = look_ahead_automaton();
        let output = automaton.add_output(b"b".to_vec(), None);
        automaton[b].first_output = Some(output);
        automaton.no_advance_no_output = true;
        let modifications = translate_nonadvancing(&mut automaton, NonadvancingVariant::Structural);
        assert_eq!(modifications, 1);
        assert_eq!(automaton.targets_for(a, b'c'), vec![(d, true)]);
    }

    #[test]
    fn aggressive_drops_dead_transition() {
        let mut automaton = Automaton::new();
        let a = automaton.start();
        let b = automaton.add_node();
        automaton[a].edges.push(Edge::single(b, false, b'c'));
        // b has no transition on 'c' at all
        let modifications = translate_nonadvancing(&mut automaton, NonadvancingVariant::Aggressive);
        assert_eq!(modifications, 1);
        assert!(automaton.targets_for(a, b'c').is_empty());
    }

    #[test]
    fn aggressive_splits_ambiguous_transition_and_conservative_keeps_it() {
        let mut base = Automaton::new();
        let a = base.start();
        let b = base.add_node();
        let d1 = base.add_node();
        let d2 = base.add_node();
        base[a].edges.push(Edge::single(b, false, b'c'));
        base[b].edges.push(Edge::single(d1, true, b'c'));
        base[b].edges.push(Edge::single(d2, true, b'c'));

        let mut aggressive = base.clone();
        assert!(translate_nonadvancing(&mut aggressive, NonadvancingVariant::Aggressive) >= 1);
        let mut targets = aggressive.targets_for(a, b'c');
        targets.sort_unstable_by_key(|&(target, _)| target.index());
        assert_eq!(targets, vec![(d1, true), (d2, true)]);

        let mut conservative = base.clone();
        assert_eq!(
            translate_nonadvancing(&mut conservative, NonadvancingVariant::Conservative),
            0
        );
        assert_eq!(conservative.targets_for(a, b'c'), vec![(b, false)]);
    }

    #[test]
    fn structural_retargets_default() {
        let mut automaton = Automaton::new();
        let a = automaton.start();
        let b = automaton.add_node();
        let d = automaton.add_node();
        automaton[a].default_target = Some(b);
        automaton[a].advance_on_default = false;
        automaton[b].default_target = Some(d);
        automaton[b].advance_on_default = true;
        let modifications = translate_nonadvancing(&mut automaton, NonadvancingVariant::Structural);
        assert_eq!(modifications, 1);
        assert_eq!(automaton[a].default_target, Some(d));
        assert!(automaton[a].advance_on_default);
    }

    #[test]
    fn nonadvancing_self_loop_is_a_fixed_point() {
        let mut automaton = Automaton::new();
        let a = automaton.start();
        automaton[a].edges.push(Edge::single(a, false, b'c'));
        for variant in [
            NonadvancingVariant::Aggressive,
            NonadvancingVariant::Conservative,
            NonadvancingVariant::Structural,
        ] {
            let mut candidate = automaton.clone();
            assert_eq!(translate_nonadvancing(&mut candidate, variant), 0);
        }
    }
}
