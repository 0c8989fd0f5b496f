//! Edge packing: rewrite a node's outgoing edges into a minimal equivalent
//! representation under a fixed cost model.

use std::collections::HashMap;

use fixedbitset::FixedBitSet;
use tinyvec::TinyVec;

use crate::intermediate::{Automaton, Edge, EdgeValues, NodeId, NUM_INPUTS};

/// Largest value count for which the vector form is cheaper than the
/// 32-byte bitmap form.
const MAX_VECTOR_VALUES: usize = 32;

/// Rewrites the edges and default of a node into a minimal equivalent form.
///
/// The node's behavior on every input byte is preserved: the set of distinct
/// `(target, advance)` pairs reachable on each input is unchanged, though
/// duplicate edges collapse. The node's output references are untouched.
///
/// The rewrite groups inputs by `(target, advance)`, promotes the largest
/// group to the default when every input is covered (unless a single other
/// group already spans all inputs), and stores each remaining group as an
/// epsilon edge (all 256 values), a value vector (fewer than 32 values), or
/// a bitmap.
pub fn optimize_edges(automaton: &mut Automaton, id: NodeId) {
    let by_input = automaton.targets_by_input(id);

    // invert into first-seen order of (target, advance)
    let mut order: Vec<(NodeId, bool)> = Vec::new();
    let mut slots: HashMap<(NodeId, bool), usize> = HashMap::new();
    let mut inputs: Vec<FixedBitSet> = Vec::new();
    let mut complete = true;
    for (value, targets) in by_input.iter().enumerate() {
        if targets.is_empty() {
            complete = false;
        }
        for &pair in targets {
            let slot = *slots.entry(pair).or_insert_with(|| {
                order.push(pair);
                inputs.push(FixedBitSet::with_capacity(NUM_INPUTS));
                inputs.len() - 1
            });
            inputs[slot].insert(value);
        }
    }

    let node = &mut automaton[id];
    node.edges.clear();
    node.default_target = None;
    if order.is_empty() {
        return;
    }

    let mut biggest = 0;
    for slot in 1..order.len() {
        if inputs[slot].count_ones(..) > inputs[biggest].count_ones(..) {
            biggest = slot;
        }
    }

    // a default is cheaper than any valued edge carrying the same inputs,
    // but promoting a full-range group would shadow the other groups
    let mut promoted = None;
    if complete && (inputs[biggest].count_ones(..) < NUM_INPUTS || order.len() == 1) {
        let (target, advance) = order[biggest];
        node.default_target = Some(target);
        node.advance_on_default = advance;
        promoted = Some(biggest);
    }

    for (slot, &(target, advance)) in order.iter().enumerate() {
        if promoted == Some(slot) {
            continue;
        }
        let count = inputs[slot].count_ones(..);
        let values = if count == NUM_INPUTS {
            EdgeValues::Epsilon
        } else if count < MAX_VECTOR_VALUES {
            let mut vector = TinyVec::new();
            vector.extend(inputs[slot].ones().map(|value| value as u8));
            EdgeValues::Vector(vector)
        } else {
            EdgeValues::Bitmap(Box::new(inputs[slot].clone()))
        };
        node.edges.push(Edge {
            target,
            advance,
            values,
        });
    }
}
