//! Shared test support: dictionary automata in the classic multi-pattern
//! shape, plus engine output collection helpers.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use ironautomata::eudoxus::{Command, Engine, ExecuteStatus};
use ironautomata::intermediate::{Automaton, Edge, NodeId, OutputId};

/// Builds an automaton matching every dictionary word anywhere in the
/// input. The start node self-loops advancing on unmatched input; suffix
/// links are non-advancing default targets; outputs carry the matched word
/// length as four little-endian bytes, and suffix outputs are shared
/// through next-output chains. Output emission on non-advancing transitions
/// is suppressed automaton-wide.
pub fn dictionary_automaton(words: &[&str]) -> Automaton {
    let mut automaton = Automaton::new();
    automaton.no_advance_no_output = true;
    let start = automaton.start();
    automaton[start].default_target = Some(start);
    automaton[start].advance_on_default = true;

    // trie
    let mut children: Vec<HashMap<u8, NodeId>> = vec![HashMap::new()];
    let mut word_length: HashMap<NodeId, u32> = HashMap::new();
    for word in words {
        let mut node = start;
        for &byte in word.as_bytes() {
            node = match children[node.index()].get(&byte).copied() {
                Some(child) => child,
                None => {
                    let child = automaton.add_node();
                    children.push(HashMap::new());
                    automaton[node].edges.push(Edge::single(child, true, byte));
                    children[node.index()].insert(byte, child);
                    child
                }
            };
        }
        word_length.insert(node, word.len() as u32);
    }

    // breadth-first suffix links
    let num_nodes = automaton.num_nodes();
    let mut suffix: Vec<NodeId> = vec![start; num_nodes];
    let mut order: Vec<NodeId> = vec![start];
    let mut queue: VecDeque<NodeId> = children[start.index()].values().copied().collect();
    order.extend(queue.iter().copied());
    while let Some(node) = queue.pop_front() {
        for (&byte, &child) in &children[node.index()] {
            let mut fallback = suffix[node.index()];
            let link = loop {
                if let Some(&next) = children[fallback.index()].get(&byte) {
                    if next != child {
                        break next;
                    }
                    break start;
                }
                if fallback == start {
                    break start;
                }
                fallback = suffix[fallback.index()];
            };
            suffix[child.index()] = link;
            order.push(child);
            queue.push_back(child);
        }
    }
    for node in automaton.node_ids() {
        if node != start {
            automaton[node].default_target = Some(suffix[node.index()]);
            automaton[node].advance_on_default = false;
        }
    }

    // outputs, inheriting the suffix node's chain; suffix nodes are closer
    // to the root and therefore already resolved
    let mut first_output: Vec<Option<OutputId>> = vec![None; num_nodes];
    for &node in &order {
        let inherited = first_output[suffix[node.index()].index()];
        first_output[node.index()] = match word_length.get(&node) {
            Some(&length) => {
                Some(automaton.add_output(length.to_le_bytes().to_vec(), inherited))
            }
            None => inherited,
        };
        automaton[node].first_output = first_output[node.index()];
    }
    automaton
}

/// Loads the image and collects `(location, content)` pairs over the input,
/// including outputs fired at state creation.
pub fn engine_outputs(image: &[u8], input: &[u8]) -> Vec<(u64, Vec<u8>)> {
    engine_outputs_chunked(image, &[input])
}

/// Like [`engine_outputs`], feeding the input in the given chunks.
pub fn engine_outputs_chunked(image: &[u8], chunks: &[&[u8]]) -> Vec<(u64, Vec<u8>)> {
    let engine = Engine::load(image.to_vec()).unwrap();
    let outputs = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&outputs);
    let mut state = engine
        .create_state(move |content: &[u8], location| {
            sink.borrow_mut().push((location, content.to_vec()));
            Command::Continue
        })
        .unwrap();
    for chunk in chunks {
        let status = state.execute(Some(chunk)).unwrap();
        assert!(matches!(status, ExecuteStatus::Ok | ExecuteStatus::End));
        if status == ExecuteStatus::End {
            break;
        }
    }
    drop(state);
    Rc::try_unwrap(outputs).unwrap().into_inner()
}

/// The expected output content for a match of the given word length.
pub fn length_content(length: u32) -> Vec<u8> {
    length.to_le_bytes().to_vec()
}
