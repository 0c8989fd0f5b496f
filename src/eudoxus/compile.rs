//! Two-pass assembly of deterministic intermediate automata into Eudoxus
//! images.
//!
//! Pass 1 lays out the nodes in breadth-first order, choosing a
//! representation per node and leaving zeroed placeholder slots for every
//! id. Pass 2 appends the output-content table, the output-list table and
//! the metadata region, then patches the placeholders with the final byte
//! offsets. Buffer growth invalidates pointers, so all bookkeeping is in
//! byte offsets.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use fixedbitset::FixedBitSet;
use log::{debug, info};
use thiserror::Error;

use super::{
    bitmap_insert, encode_id, flags, Header, IdWidth, NodeKind, HEADER_LEN, PAD_BYTE,
};
use crate::intermediate::{Automaton, NodeId, OutputId, NUM_INPUTS};
use crate::options::CompileOptions;

/// Longest run count a high node stores per-byte targets for before
/// switching to one target per run via the ALI bitmap.
const ALI_THRESHOLD: usize = 32;

/// Longest path a single path-compressed node can span.
const MAX_PC_LENGTH: usize = 255;

/// An error raised during compilation.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid option: {0}")]
    Config(String),
    #[error("node {0} is non-deterministic on input {1}")]
    NonDeterministic(NodeId, u8),
    #[error("node {0} carries an epsilon edge")]
    EpsilonEdge(NodeId),
    #[error("an id does not fit in {0} bytes")]
    IdOverflow(usize),
    #[error("internal error: {0}")]
    Insane(String),
}

/// Per-kind node counts and byte totals of a compiled image.
#[derive(Debug, Default, Clone)]
pub struct CompileStats {
    pub low_nodes: usize,
    pub low_bytes: u64,
    pub high_nodes: usize,
    pub high_bytes: u64,
    pub pc_nodes: usize,
    pub pc_bytes: u64,
    pub padding_bytes: u64,
}

impl CompileStats {
    fn record(&mut self, kind: NodeKind, bytes: u64) {
        match kind {
            NodeKind::Low => {
                self.low_nodes += 1;
                self.low_bytes += bytes;
            }
            NodeKind::High => {
                self.high_nodes += 1;
                self.high_bytes += bytes;
            }
            NodeKind::Pc => {
                self.pc_nodes += 1;
                self.pc_bytes += bytes;
            }
        }
    }
}

impl fmt::Display for CompileStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "low: {} nodes / {} bytes, high: {} nodes / {} bytes, \
             pc: {} nodes / {} bytes, padding: {} bytes",
            self.low_nodes,
            self.low_bytes,
            self.high_nodes,
            self.high_bytes,
            self.pc_nodes,
            self.pc_bytes,
            self.padding_bytes
        )
    }
}

/// The outcome of a successful compilation.
pub struct CompileResult {
    /// The Eudoxus image.
    pub image: Vec<u8>,
    /// The id width used, after automatic selection.
    pub id_width: IdWidth,
    /// The node alignment applied.
    pub align_to: usize,
    /// The high-node weight applied.
    pub high_node_weight: f64,
    pub stats: CompileStats,
}

/// Compiles a deterministic intermediate automaton into a Eudoxus image.
///
/// With `id_width` 0, compilation is retried at widths 1, 2, 4 and 8 in
/// order, and the smallest width whose offsets do not overflow is kept.
///
/// # Errors
///
/// Returns an error if the options are out of range, if the automaton is
/// non-deterministic or carries an epsilon edge, or if a fixed `id_width`
/// cannot represent every offset.
pub fn compile(
    automaton: &Automaton,
    options: &CompileOptions,
) -> Result<CompileResult, CompileError> {
    if options.align_to == 0 {
        return Err(CompileError::Config("align_to must be at least 1".into()));
    }
    if !(options.high_node_weight >= 1.0) {
        return Err(CompileError::Config(
            "high_node_weight must be at least 1.0".into(),
        ));
    }
    info!(
        "Compiling automaton with {} nodes and {} outputs",
        automaton.num_nodes(),
        automaton.num_outputs()
    );
    let result = if options.id_width == 0 {
        let mut attempts = IdWidth::ALL.iter();
        loop {
            let width = attempts
                .next()
                .ok_or_else(|| CompileError::Insane("all id widths overflowed".into()))?;
            match attempt(automaton, *width, options) {
                Ok(result) => break result,
                Err(CompileError::IdOverflow(bytes)) => {
                    debug!("id width {} overflowed, retrying at the next width", bytes);
                }
                Err(error) => return Err(error),
            }
        }
    } else {
        let width = IdWidth::from_bytes(options.id_width).ok_or_else(|| {
            CompileError::Config(format!(
                "id_width must be 0, 1, 2, 4 or 8, not {}",
                options.id_width
            ))
        })?;
        attempt(automaton, width, options)?
    };
    info!(
        "Compiled image of {} bytes at id width {} ({})",
        result.image.len(),
        result.id_width.bytes(),
        result.stats
    );
    Ok(result)
}

fn attempt(
    automaton: &Automaton,
    width: IdWidth,
    options: &CompileOptions,
) -> Result<CompileResult, CompileError> {
    let mut assembler = Assembler {
        automaton,
        width,
        align_to: options.align_to,
        high_node_weight: options.high_node_weight,
        buffer: vec![0; HEADER_LEN],
        node_offsets: vec![None; automaton.num_nodes()],
        fixups: Vec::new(),
        stats: CompileStats::default(),
    };
    let header = assembler.assemble()?;
    let mut image = assembler.buffer;
    header.encode(&mut image[..HEADER_LEN]);
    Ok(CompileResult {
        image,
        id_width: width,
        align_to: options.align_to,
        high_node_weight: options.high_node_weight,
        stats: assembler.stats,
    })
}

/// The unique transition of a node per input byte, with the default already
/// substituted for uncovered inputs.
struct TargetTable {
    targets: Vec<Option<(NodeId, bool)>>,
    default: Option<(NodeId, bool)>,
}

fn target_table(automaton: &Automaton, id: NodeId) -> Result<TargetTable, CompileError> {
    if automaton[id].edges.iter().any(|edge| edge.is_epsilon()) {
        return Err(CompileError::EpsilonEdge(id));
    }
    let by_input = automaton.targets_by_input(id);
    let mut targets = Vec::with_capacity(NUM_INPUTS);
    for (value, pairs) in by_input.iter().enumerate() {
        let mut distinct = pairs.clone();
        distinct.sort_unstable_by_key(|&(target, advance)| (target.index(), advance));
        distinct.dedup();
        if distinct.len() > 1 {
            return Err(CompileError::NonDeterministic(id, value as u8));
        }
        targets.push(distinct.first().copied());
    }
    let node = &automaton[id];
    Ok(TargetTable {
        targets,
        default: node.default_target.map(|d| (d, node.advance_on_default)),
    })
}

/// Shape of a node as the cost oracle sees it: the inputs served by
/// non-default targets and the statistics the cost formulas need.
struct NodeShape {
    first_output: Option<OutputId>,
    default: Option<(NodeId, bool)>,
    /// `(value, target, advance)` for every input byte whose transition
    /// differs from the default behavior, ascending by value.
    served: Vec<(u8, NodeId, bool)>,
    num_consecutive: usize,
    has_nonadvancing: bool,
}

impl NodeShape {
    fn analyze(automaton: &Automaton, id: NodeId, table: &TargetTable) -> Self {
        let mut served = Vec::new();
        let mut num_consecutive = 0;
        let mut has_nonadvancing = false;
        for value in 0..NUM_INPUTS {
            let pair = match table.targets[value] {
                Some(pair) if Some(pair) != table.default => pair,
                _ => continue,
            };
            if let Some(&(prev_value, prev_target, prev_advance)) = served.last() {
                if prev_value as usize == value - 1 && (prev_target, prev_advance) == pair {
                    num_consecutive += 1;
                }
            }
            has_nonadvancing |= !pair.1;
            served.push((value as u8, pair.0, pair.1));
        }
        Self {
            first_output: automaton[id].first_output,
            default: table.default,
            served,
            num_consecutive,
            has_nonadvancing,
        }
    }

    fn out_degree(&self) -> usize {
        self.served.len()
    }

    fn use_ali(&self) -> bool {
        self.num_consecutive > ALI_THRESHOLD
    }

    fn low_cost(&self, width: IdWidth) -> u64 {
        let w = width.bytes();
        let out_degree = self.out_degree();
        let mut cost = 1;
        if self.first_output.is_some() {
            cost += w;
        }
        if out_degree > 0 {
            cost += 1;
        }
        if self.default.is_some() {
            cost += w;
        }
        if self.has_nonadvancing && out_degree > 0 {
            cost += (out_degree + 7) / 8;
        }
        cost += out_degree * (1 + w);
        cost as u64
    }

    fn high_cost(&self, width: IdWidth) -> u64 {
        let w = width.bytes();
        let out_degree = self.out_degree();
        let mut cost = 1;
        if self.first_output.is_some() {
            cost += w;
        }
        if self.default.is_some() {
            cost += w;
        }
        if self.has_nonadvancing {
            cost += 32;
        }
        if out_degree < NUM_INPUTS {
            cost += 32;
        }
        if self.use_ali() {
            cost += 32;
            cost += w * (out_degree - self.num_consecutive);
        } else {
            cost += w * out_degree;
        }
        cost as u64
    }
}

/// A path-compressed chain: the absorbed nodes, one path byte per node, and
/// the node the chain lands on after the last byte.
struct Chain {
    nodes: Vec<NodeId>,
    path: Vec<u8>,
    final_target: NodeId,
}

/// A placeholder id slot awaiting its final value.
enum Slot {
    Node(NodeId),
    Output(OutputId),
}

struct Assembler<'a> {
    automaton: &'a Automaton,
    width: IdWidth,
    align_to: usize,
    high_node_weight: f64,
    buffer: Vec<u8>,
    node_offsets: Vec<Option<u64>>,
    fixups: Vec<(usize, Slot)>,
    stats: CompileStats,
}

impl<'a> Assembler<'a> {
    fn assemble(&mut self) -> Result<Header, CompileError> {
        self.layout_nodes()?;
        self.layout_outputs_and_metadata()
    }

    fn check_id(&self, value: u64) -> Result<u64, CompileError> {
        if value > self.width.max_id() {
            Err(CompileError::IdOverflow(self.width.bytes()))
        } else {
            Ok(value)
        }
    }

    /// Appends a zeroed id slot to be patched in pass 2.
    fn push_slot(&mut self, slot: Slot) {
        self.fixups.push((self.buffer.len(), slot));
        self.buffer
            .extend(std::iter::repeat(0).take(self.width.bytes()));
    }

    /// Appends an id with a known value.
    fn push_id(&mut self, value: u64) -> Result<(), CompileError> {
        self.check_id(value)?;
        let at = self.buffer.len();
        self.buffer
            .extend(std::iter::repeat(0).take(self.width.bytes()));
        encode_id(value, self.width, &mut self.buffer[at..]);
        Ok(())
    }

    fn align(&mut self) {
        let over = self.buffer.len() % self.align_to;
        if over != 0 {
            let pad = self.align_to - over;
            self.buffer.extend(std::iter::repeat(PAD_BYTE).take(pad));
            self.stats.padding_bytes += pad as u64;
        }
    }

    fn layout_nodes(&mut self) -> Result<(), CompileError> {
        let parent_counts = self.automaton.parent_counts();
        let num_nodes = self.automaton.num_nodes();
        let mut seen = FixedBitSet::with_capacity(num_nodes);
        let mut laid_out = FixedBitSet::with_capacity(num_nodes);
        let mut queue = VecDeque::new();
        let start = self.automaton.start();
        seen.insert(start.index());
        queue.push_back(start);

        while let Some(id) = queue.pop_front() {
            if laid_out.contains(id.index()) {
                continue;
            }
            if let Some(chain) = self.pc_chain(id, &parent_counts, &laid_out) {
                for &member in &chain.nodes {
                    laid_out.insert(member.index());
                }
                self.emit_pc(&chain)?;
                let default = self.automaton[id].default_target;
                if !seen.put(chain.final_target.index()) {
                    queue.push_back(chain.final_target);
                }
                if let Some(default) = default {
                    if !seen.put(default.index()) {
                        queue.push_back(default);
                    }
                }
                continue;
            }
            let table = target_table(self.automaton, id)?;
            let shape = NodeShape::analyze(self.automaton, id, &table);
            laid_out.insert(id.index());
            self.emit_generic(id, &shape)?;
            for &(_, target, _) in &shape.served {
                if !seen.put(target.index()) {
                    queue.push_back(target);
                }
            }
            if let Some((default, _)) = shape.default {
                if !seen.put(default.index()) {
                    queue.push_back(default);
                }
            }
        }
        Ok(())
    }

    /// The single single-value advancing edge of a node, if it has exactly
    /// that and nothing else.
    fn single_advancing_edge(&self, id: NodeId) -> Option<(u8, NodeId)> {
        let node = &self.automaton[id];
        if node.edges.len() != 1 {
            return None;
        }
        let edge = &node.edges[0];
        if edge.num_values() != 1 || !edge.advance {
            return None;
        }
        Some((edge.values().next().unwrap(), edge.target))
    }

    /// Greedily extends a path-compressed chain from `head`. Returns a chain
    /// only when at least two path bytes can be spanned.
    fn pc_chain(
        &self,
        head: NodeId,
        parent_counts: &[u32],
        laid_out: &FixedBitSet,
    ) -> Option<Chain> {
        let (value, mut child) = self.single_advancing_edge(head)?;
        let mut nodes = vec![head];
        let mut path = vec![value];
        loop {
            if path.len() >= MAX_PC_LENGTH {
                break;
            }
            let tail = *nodes.last().unwrap();
            if child == self.automaton.start()
                || laid_out.contains(child.index())
                || nodes.contains(&child)
                || parent_counts[child.index()] != 1
                || self.automaton[child].first_output.is_some()
            {
                break;
            }
            let Some((child_value, grandchild)) = self.single_advancing_edge(child) else {
                break;
            };
            let tail_node = &self.automaton[tail];
            let child_node = &self.automaton[child];
            if child_node.default_target != tail_node.default_target
                || child_node.advance_on_default != tail_node.advance_on_default
            {
                break;
            }
            nodes.push(child);
            path.push(child_value);
            child = grandchild;
        }
        if path.len() < 2 {
            return None;
        }
        Some(Chain {
            final_target: child,
            nodes,
            path,
        })
    }

    fn emit_pc(&mut self, chain: &Chain) -> Result<(), CompileError> {
        self.align();
        let offset = self.buffer.len() as u64;
        let head = chain.nodes[0];
        self.node_offsets[head.index()] = Some(offset);

        let head_node = &self.automaton[head];
        let first_output = head_node.first_output;
        let default = head_node.default_target;
        let advance_on_final = self.automaton[*chain.nodes.last().unwrap()].edges[0].advance;
        let length = chain.path.len();
        let length_code = match length {
            2 => 0,
            3 => 1,
            4 => 2,
            _ => flags::PC_LENGTH_EXPLICIT,
        };

        let mut header = NodeKind::Pc.header_bits() | (length_code << flags::PC_LENGTH_SHIFT);
        if first_output.is_some() {
            header |= flags::PC_HAS_OUTPUT;
        }
        if default.is_some() {
            header |= flags::PC_HAS_DEFAULT;
        }
        if head_node.advance_on_default {
            header |= flags::PC_ADVANCE_ON_DEFAULT;
        }
        if advance_on_final {
            header |= flags::PC_ADVANCE_ON_FINAL;
        }
        self.buffer.push(header);
        if let Some(output) = first_output {
            self.push_slot(Slot::Output(output));
        }
        if let Some(default) = default {
            self.push_slot(Slot::Node(default));
        }
        if length_code == flags::PC_LENGTH_EXPLICIT {
            self.buffer.push(length as u8);
        }
        self.push_slot(Slot::Node(chain.final_target));
        self.buffer.extend_from_slice(&chain.path);

        let w = self.width.bytes() as u64;
        let mut expected = 1 + w + length as u64;
        if first_output.is_some() {
            expected += w;
        }
        if default.is_some() {
            expected += w;
        }
        if length_code == flags::PC_LENGTH_EXPLICIT {
            expected += 1;
        }
        let written = self.buffer.len() as u64 - offset;
        if written != expected {
            return Err(CompileError::Insane(format!(
                "pc node wrote {} bytes, predicted {}",
                written, expected
            )));
        }
        self.stats.record(NodeKind::Pc, written);
        Ok(())
    }

    fn emit_generic(&mut self, id: NodeId, shape: &NodeShape) -> Result<(), CompileError> {
        // a low node stores its degree in one byte
        let force_high = shape.out_degree() > 255;
        let low = shape.low_cost(self.width);
        let high = shape.high_cost(self.width);
        if force_high || (high as f64) * self.high_node_weight <= low as f64 {
            self.emit_high(id, shape, high)
        } else {
            self.emit_low(id, shape, low)
        }
    }

    fn emit_low(&mut self, id: NodeId, shape: &NodeShape, predicted: u64) -> Result<(), CompileError> {
        self.align();
        let offset = self.buffer.len() as u64;
        self.node_offsets[id.index()] = Some(offset);

        let out_degree = shape.out_degree();
        let mut header = NodeKind::Low.header_bits();
        if shape.first_output.is_some() {
            header |= flags::LOW_HAS_OUTPUT;
        }
        if shape.has_nonadvancing {
            header |= flags::LOW_HAS_NONADVANCING;
        }
        if shape.default.is_some() {
            header |= flags::LOW_HAS_DEFAULT;
        }
        if let Some((_, advance)) = shape.default {
            if advance {
                header |= flags::LOW_ADVANCE_ON_DEFAULT;
            }
        }
        if out_degree > 0 {
            header |= flags::LOW_HAS_EDGES;
        }
        self.buffer.push(header);
        if let Some(output) = shape.first_output {
            self.push_slot(Slot::Output(output));
        }
        if out_degree > 0 {
            self.buffer.push(out_degree as u8);
        }
        if let Some((default, _)) = shape.default {
            self.push_slot(Slot::Node(default));
        }
        if shape.has_nonadvancing && out_degree > 0 {
            let mut bitmap = vec![0_u8; (out_degree + 7) / 8];
            for (position, &(_, _, advance)) in shape.served.iter().enumerate() {
                if !advance {
                    bitmap[position / 8] |= 1 << (position % 8);
                }
            }
            self.buffer.extend_from_slice(&bitmap);
        }
        for &(value, target, _) in &shape.served {
            self.buffer.push(value);
            self.push_slot(Slot::Node(target));
        }

        let written = self.buffer.len() as u64 - offset;
        if written != predicted {
            return Err(CompileError::Insane(format!(
                "low node {} wrote {} bytes, predicted {}",
                id, written, predicted
            )));
        }
        self.stats.record(NodeKind::Low, written);
        Ok(())
    }

    fn emit_high(&mut self, id: NodeId, shape: &NodeShape, predicted: u64) -> Result<(), CompileError> {
        self.align();
        let offset = self.buffer.len() as u64;
        self.node_offsets[id.index()] = Some(offset);

        let out_degree = shape.out_degree();
        let has_target_bm = out_degree < NUM_INPUTS;
        let use_ali = shape.use_ali();
        let mut header = NodeKind::High.header_bits();
        if shape.first_output.is_some() {
            header |= flags::HIGH_HAS_OUTPUT;
        }
        if shape.has_nonadvancing {
            header |= flags::HIGH_HAS_NONADVANCING;
        }
        if shape.default.is_some() {
            header |= flags::HIGH_HAS_DEFAULT;
        }
        if let Some((_, advance)) = shape.default {
            if advance {
                header |= flags::HIGH_ADVANCE_ON_DEFAULT;
            }
        }
        if has_target_bm {
            header |= flags::HIGH_HAS_TARGET_BM;
        }
        if use_ali {
            header |= flags::HIGH_HAS_ALI_BM;
        }
        self.buffer.push(header);
        if let Some(output) = shape.first_output {
            self.push_slot(Slot::Output(output));
        }
        if let Some((default, _)) = shape.default {
            self.push_slot(Slot::Node(default));
        }
        if shape.has_nonadvancing {
            let mut bitmap = [0_u8; 32];
            for &(value, _, advance) in &shape.served {
                if !advance {
                    bitmap_insert(&mut bitmap, value);
                }
            }
            self.buffer.extend_from_slice(&bitmap);
        }
        if has_target_bm {
            let mut bitmap = [0_u8; 32];
            for &(value, _, _) in &shape.served {
                bitmap_insert(&mut bitmap, value);
            }
            self.buffer.extend_from_slice(&bitmap);
        }
        // one target per run of consecutive bytes sharing a target when the
        // ali bitmap is used, otherwise one per served byte
        let mut run_starts = Vec::new();
        let mut previous: Option<(u8, NodeId, bool)> = None;
        for &(value, target, advance) in &shape.served {
            let continues = matches!(
                previous,
                Some((prev_value, prev_target, prev_advance))
                    if prev_value as usize + 1 == value as usize
                        && (prev_target, prev_advance) == (target, advance)
            );
            if !continues {
                run_starts.push((value, target));
            }
            previous = Some((value, target, advance));
        }
        if use_ali {
            let mut bitmap = [0_u8; 32];
            for &(value, _) in &run_starts {
                bitmap_insert(&mut bitmap, value);
            }
            self.buffer.extend_from_slice(&bitmap);
            for &(_, target) in &run_starts {
                self.push_slot(Slot::Node(target));
            }
        } else {
            for &(_, target, _) in &shape.served {
                self.push_slot(Slot::Node(target));
            }
        }

        let written = self.buffer.len() as u64 - offset;
        if written != predicted {
            return Err(CompileError::Insane(format!(
                "high node {} wrote {} bytes, predicted {}",
                id, written, predicted
            )));
        }
        self.stats.record(NodeKind::High, written);
        Ok(())
    }

    /// Pass 2: output tables, metadata, and placeholder patching.
    fn layout_outputs_and_metadata(&mut self) -> Result<Header, CompileError> {
        // outputs referenced from laid-out nodes, in first-reference order,
        // with every chain fully walked
        let mut chain_order: Vec<OutputId> = Vec::new();
        let mut seen = FixedBitSet::with_capacity(self.automaton.num_outputs());
        for (_, slot) in &self.fixups {
            if let Slot::Output(id) = slot {
                let mut current = Some(*id);
                while let Some(output) = current {
                    if seen.put(output.index()) {
                        break;
                    }
                    chain_order.push(output);
                    current = self.automaton[output].next;
                }
            }
        }

        let first_output = self.buffer.len() as u64;
        let mut content_offsets: HashMap<&[u8], u64> = HashMap::new();
        let mut num_outputs = 0;
        for &output in &chain_order {
            let content: &[u8] = &self.automaton[output].content;
            if content_offsets.contains_key(content) {
                continue;
            }
            content_offsets.insert(content, self.buffer.len() as u64);
            num_outputs += 1;
            self.buffer
                .extend_from_slice(&(content.len() as u32).to_ne_bytes());
            self.buffer.extend_from_slice(content);
        }

        let first_output_list = self.buffer.len() as u64;
        let cell_size = 2 * self.width.bytes() as u64;
        let with_successor: Vec<OutputId> = chain_order
            .iter()
            .copied()
            .filter(|&output| self.automaton[output].next.is_some())
            .collect();
        let mut cell_offsets: HashMap<OutputId, u64> = HashMap::new();
        for (position, &output) in with_successor.iter().enumerate() {
            cell_offsets.insert(output, first_output_list + position as u64 * cell_size);
        }
        let resolve = |output: OutputId| -> u64 {
            match self.automaton[output].next {
                Some(_) => cell_offsets[&output],
                None => content_offsets[self.automaton[output].content.as_slice()],
            }
        };
        let cells: Vec<(u64, u64)> = with_successor
            .iter()
            .map(|&output| {
                let content = content_offsets[self.automaton[output].content.as_slice()];
                let next = resolve(self.automaton[output].next.unwrap());
                (content, next)
            })
            .collect();
        for (content, next) in cells {
            self.push_id(content)?;
            self.push_id(next)?;
        }

        let metadata_index = self.buffer.len() as u64;
        for (key, value) in self.automaton.metadata() {
            self.buffer
                .extend_from_slice(&(key.len() as u32).to_ne_bytes());
            self.buffer.extend_from_slice(key);
            self.buffer
                .extend_from_slice(&(value.len() as u32).to_ne_bytes());
            self.buffer.extend_from_slice(value);
        }

        // patch the placeholders now that all offsets are known
        for (at, slot) in std::mem::take(&mut self.fixups) {
            let value = match slot {
                Slot::Node(node) => self.node_offsets[node.index()].ok_or_else(|| {
                    CompileError::Insane(format!("node {} referenced but never laid out", node))
                })?,
                Slot::Output(output) => {
                    let output_ref = match self.automaton[output].next {
                        Some(_) => cell_offsets[&output],
                        None => content_offsets[self.automaton[output].content.as_slice()],
                    };
                    output_ref
                }
            };
            self.check_id(value)?;
            let w = self.width.bytes();
            encode_id(value, self.width, &mut self.buffer[at..at + w]);
        }

        let start_index = self.node_offsets[self.automaton.start().index()]
            .ok_or_else(|| CompileError::Insane("start node was not laid out".into()))?;
        Ok(Header {
            id_width: self.width,
            is_big_endian: cfg!(target_endian = "big"),
            no_advance_no_output: self.automaton.no_advance_no_output,
            num_nodes: (self.stats.low_nodes + self.stats.high_nodes + self.stats.pc_nodes) as u64,
            num_outputs,
            num_output_lists: with_successor.len() as u64,
            num_metadata: self.automaton.metadata().len() as u64,
            data_length: self.buffer.len() as u64,
            start_index,
            first_output,
            first_output_list,
            metadata_index,
        })
    }
}
