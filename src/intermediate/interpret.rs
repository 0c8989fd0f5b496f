//! Direct execution of intermediate automata.
//!
//! The interpreter mirrors the Eudoxus engine semantics on the mutable graph
//! itself. It serves as the oracle the compiled image is validated against.

use thiserror::Error;

use super::{Automaton, NodeId};

/// An error raised while interpreting an intermediate automaton.
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("node {node} is non-deterministic on input {input}")]
    NonDeterministic { node: NodeId, input: u8 },
}

/// Execution state of the reference interpreter.
pub struct Runner<'a> {
    automaton: &'a Automaton,
    node: NodeId,
    location: u64,
}

impl<'a> Runner<'a> {
    /// Creates a runner positioned at the start node. The start node's
    /// outputs are not emitted here; see [`Runner::current_outputs`].
    pub fn new(automaton: &'a Automaton) -> Self {
        Self {
            automaton,
            node: automaton.start(),
            location: 0,
        }
    }

    pub fn location(&self) -> u64 {
        self.location
    }

    /// Emits the output chain of the current node.
    pub fn current_outputs<F: FnMut(&[u8], u64)>(&self, emit: &mut F) {
        let mut output = self.automaton[self.node].first_output;
        while let Some(id) = output {
            let entry = &self.automaton[id];
            emit(&entry.content, self.location);
            output = entry.next;
        }
    }

    /// Advances the runner across the input, emitting outputs as nodes are
    /// entered. Returns false if execution reached a dead end before the
    /// input was exhausted.
    pub fn run<F: FnMut(&[u8], u64)>(
        &mut self,
        input: &[u8],
        emit: &mut F,
    ) -> Result<bool, InterpretError> {
        let mut pos = 0;
        while pos < input.len() {
            let value = input[pos];
            let mut targets = self.automaton.targets_for(self.node, value);
            targets.sort_unstable_by_key(|&(target, advance)| (target.index(), advance));
            targets.dedup();
            let (target, advance) = match targets.len() {
                0 => return Ok(false),
                1 => targets[0],
                _ => {
                    return Err(InterpretError::NonDeterministic {
                        node: self.node,
                        input: value,
                    })
                }
            };
            if advance {
                pos += 1;
                self.location += 1;
            }
            self.node = target;
            if !self.automaton.no_advance_no_output || advance {
                self.current_outputs(emit);
            }
        }
        Ok(true)
    }
}

/// Runs the automaton over the input and collects all emitted outputs as
/// `(location, content)` pairs, including the start node's outputs.
pub fn collect_outputs(
    automaton: &Automaton,
    input: &[u8],
) -> Result<Vec<(u64, Vec<u8>)>, InterpretError> {
    let mut collected = Vec::new();
    let mut emit = |content: &[u8], location: u64| collected.push((location, content.to_vec()));
    let mut runner = Runner::new(automaton);
    runner.current_outputs(&mut emit);
    runner.run(input, &mut emit)?;
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intermediate::Edge;

    #[test]
    fn emits_in_chain_order() {
        let mut automaton = Automaton::new();
        let start = automaton.start();
        let hit = automaton.add_node();
        let tail = automaton.add_output(b"tail".to_vec(), None);
        let head = automaton.add_output(b"head".to_vec(), Some(tail));
        automaton[hit].first_output = Some(head);
        automaton[start].edges.push(Edge::single(hit, true, b'a'));
        automaton[start].default_target = Some(start);

        let outputs = collect_outputs(&automaton, b"xa").unwrap();
        assert_eq!(
            outputs,
            vec![(2, b"head".to_vec()), (2, b"tail".to_vec())]
        );
    }

    #[test]
    fn nonadvancing_transition_retries_input() {
        let mut automaton = Automaton::new();
        let start = automaton.start();
        let middle = automaton.add_node();
        let hit = automaton.add_node();
        let output = automaton.add_output(b"m".to_vec(), None);
        automaton[hit].first_output = Some(output);
        automaton[start].edges.push(Edge::single(middle, false, b'a'));
        automaton[middle].edges.push(Edge::single(hit, true, b'a'));

        let outputs = collect_outputs(&automaton, b"a").unwrap();
        assert_eq!(outputs, vec![(1, b"m".to_vec())]);
    }

    #[test]
    fn dead_end_reports_false() {
        let automaton = Automaton::new();
        let mut runner = Runner::new(&automaton);
        let mut emit = |_: &[u8], _: u64| {};
        assert!(!runner.run(b"a", &mut emit).unwrap());
    }

    #[test]
    fn ambiguous_transition_is_an_error() {
        let mut automaton = Automaton::new();
        let start = automaton.start();
        let a = automaton.add_node();
        let b = automaton.add_node();
        automaton[start].edges.push(Edge::single(a, true, b'x'));
        automaton[start].edges.push(Edge::single(b, true, b'x'));

        assert!(collect_outputs(&automaton, b"x").is_err());
    }
}
