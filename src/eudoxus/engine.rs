//! Streaming execution of Eudoxus images.
//!
//! The per-step routines differ between id widths only in the size of the
//! offset type, so they are instantiated once per width and the engine picks
//! the instantiation at load time.

use thiserror::Error;

use super::{
    bitmap_contains, bitmap_rank, decode_id, flags, FormatError, Header, IdWidth, NodeKind,
};

/// An error raised while loading or executing an image.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed image: {0}")]
    Invalid(String),
    #[error("incompatible image: {0}")]
    Incompatible(String),
    #[error("output callback requested abort")]
    Callback,
    #[error("internal error: {0}")]
    Insane(String),
}

impl From<FormatError> for EngineError {
    fn from(error: FormatError) -> Self {
        match error {
            FormatError::Version(_) | FormatError::Endianness => {
                Self::Incompatible(error.to_string())
            }
            _ => Self::Invalid(error.to_string()),
        }
    }
}

/// Verdict returned by an output callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Command {
    /// Keep executing.
    Continue,
    /// Stop executing; the state stays usable and outputs of the current
    /// node can be re-emitted by executing without input.
    Stop,
    /// Abort; the state must be treated as poisoned.
    Error,
}

/// Result of advancing a state across input.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecuteStatus {
    /// All input was consumed.
    Ok,
    /// No transition was possible.
    End,
    /// A callback requested a stop.
    Stop,
}

impl std::fmt::Display for ExecuteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Ok => "ok",
            Self::End => "end",
            Self::Stop => "stop",
        };
        write!(f, "{}", status)
    }
}

/// A loaded Eudoxus image. Read-only after load and shareable across
/// threads; execution state lives in [`State`] objects that borrow it.
pub struct Engine {
    buffer: Vec<u8>,
    header: Header,
}

impl Engine {
    /// Validates and loads an image.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Incompatible`] on a version or endianness
    /// mismatch and [`EngineError::Invalid`] on malformed fixed fields.
    pub fn load(buffer: Vec<u8>) -> Result<Self, EngineError> {
        let header = Header::decode(&buffer)?;
        let length = buffer.len() as u64;
        if header.data_length != length {
            return Err(EngineError::Invalid(format!(
                "data length field {} does not match buffer length {}",
                header.data_length, length
            )));
        }
        if header.start_index < super::HEADER_LEN as u64 || header.start_index >= length {
            return Err(EngineError::Invalid(format!(
                "start index {} out of range",
                header.start_index
            )));
        }
        if header.first_output > header.first_output_list
            || header.first_output_list > header.metadata_index
            || header.metadata_index > length
        {
            return Err(EngineError::Invalid("output regions out of order".into()));
        }
        Ok(Self { buffer, header })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Creates an execution state at the start node and immediately emits
    /// the start node's outputs to the callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is malformed at the start node or the
    /// callback aborts. A callback stop during creation is not an error.
    pub fn create_state<'e, F>(&'e self, callback: F) -> Result<State<'e>, EngineError>
    where
        F: FnMut(&[u8], u64) -> Command + 'e,
    {
        let mut state = State {
            engine: self,
            callback: Box::new(callback),
            node: self.header.start_index,
            path_pos: 0,
            location: 0,
        };
        match state.emit_current(true)? {
            Command::Error => Err(EngineError::Callback),
            _ => Ok(state),
        }
    }

    /// All metadata pairs, in insertion order.
    pub fn metadata(&self) -> Result<Vec<(&[u8], &[u8])>, EngineError> {
        let mut at = self.header.metadata_index as usize;
        let mut pairs = Vec::with_capacity(self.header.num_metadata as usize);
        for _ in 0..self.header.num_metadata {
            let key = self.read_len_prefixed(&mut at)?;
            let value = self.read_len_prefixed(&mut at)?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    /// The value stored for the given metadata key, if any.
    pub fn metadata_with_key(&self, key: &[u8]) -> Result<Option<&[u8]>, EngineError> {
        Ok(self
            .metadata()?
            .into_iter()
            .find(|&(k, _)| k == key)
            .map(|(_, value)| value))
    }

    /// Enumerates every output-content entry in the image. A callback stop
    /// ends the enumeration without error.
    pub fn all_outputs<F: FnMut(&[u8]) -> Command>(
        &self,
        mut callback: F,
    ) -> Result<(), EngineError> {
        let mut at = self.header.first_output as usize;
        let end = self.header.first_output_list as usize;
        while at < end {
            let content = self.read_content(&mut at)?;
            match callback(content) {
                Command::Continue => {}
                Command::Stop => return Ok(()),
                Command::Error => return Err(EngineError::Callback),
            }
        }
        Ok(())
    }

    fn read_len_prefixed(&self, at: &mut usize) -> Result<&[u8], EngineError> {
        self.read_content(at)
    }

    /// Reads a length-prefixed byte string at `*at`, advancing the cursor.
    fn read_content(&self, at: &mut usize) -> Result<&[u8], EngineError> {
        let length_end = at
            .checked_add(4)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(|| EngineError::Invalid("truncated length prefix".into()))?;
        let length =
            u32::from_ne_bytes(self.buffer[*at..length_end].try_into().unwrap()) as usize;
        let end = length_end
            .checked_add(length)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(|| EngineError::Invalid("truncated byte string".into()))?;
        let content = &self.buffer[length_end..end];
        *at = end;
        Ok(content)
    }
}

/// Width-specific id access, instantiated once per supported width.
trait IdKind {
    const BYTES: usize;
    const WIDTH: IdWidth;
}

struct Id1;
struct Id2;
struct Id4;
struct Id8;

impl IdKind for Id1 {
    const BYTES: usize = 1;
    const WIDTH: IdWidth = IdWidth::W1;
}
impl IdKind for Id2 {
    const BYTES: usize = 2;
    const WIDTH: IdWidth = IdWidth::W2;
}
impl IdKind for Id4 {
    const BYTES: usize = 4;
    const WIDTH: IdWidth = IdWidth::W4;
}
impl IdKind for Id8 {
    const BYTES: usize = 8;
    const WIDTH: IdWidth = IdWidth::W8;
}

fn truncated() -> EngineError {
    EngineError::Invalid("node object truncated".into())
}

fn read_id<K: IdKind>(buffer: &[u8], at: usize) -> Result<u64, EngineError> {
    let end = at.checked_add(K::BYTES).filter(|&end| end <= buffer.len());
    match end {
        Some(end) => Ok(decode_id(&buffer[at..end], K::WIDTH)),
        None => Err(truncated()),
    }
}

fn read_bytes(buffer: &[u8], at: usize, length: usize) -> Result<&[u8], EngineError> {
    let end = at.checked_add(length).filter(|&end| end <= buffer.len());
    match end {
        Some(end) => Ok(&buffer[at..end]),
        None => Err(truncated()),
    }
}

/// The transition a node prescribes for one input byte.
enum Next {
    Transition { target: u64, advance: bool },
    End,
}

fn next_low<K: IdKind>(buffer: &[u8], node: usize, value: u8) -> Result<Next, EngineError> {
    let header = buffer[node];
    let mut at = node + 1;
    if header & flags::LOW_HAS_OUTPUT != 0 {
        at += K::BYTES;
    }
    let out_degree = if header & flags::LOW_HAS_EDGES != 0 {
        let degree = *buffer.get(at).ok_or_else(truncated)?;
        at += 1;
        degree as usize
    } else {
        0
    };
    let default = if header & flags::LOW_HAS_DEFAULT != 0 {
        let id = read_id::<K>(buffer, at)?;
        at += K::BYTES;
        Some(id)
    } else {
        None
    };
    let advance_bitmap = if header & flags::LOW_HAS_NONADVANCING != 0 && out_degree > 0 {
        let bitmap = read_bytes(buffer, at, (out_degree + 7) / 8)?;
        at += bitmap.len();
        Some(bitmap)
    } else {
        None
    };
    let entry_size = 1 + K::BYTES;
    let edges = read_bytes(buffer, at, out_degree * entry_size)?;
    for position in 0..out_degree {
        let entry = &edges[position * entry_size..];
        if entry[0] == value {
            let target = decode_id(&entry[1..1 + K::BYTES], K::WIDTH);
            let advance = match advance_bitmap {
                Some(bitmap) => bitmap[position / 8] & (1 << (position % 8)) == 0,
                None => true,
            };
            return Ok(Next::Transition { target, advance });
        }
    }
    Ok(match default {
        Some(target) => Next::Transition {
            target,
            advance: header & flags::LOW_ADVANCE_ON_DEFAULT != 0,
        },
        None => Next::End,
    })
}

fn next_high<K: IdKind>(buffer: &[u8], node: usize, value: u8) -> Result<Next, EngineError> {
    let header = buffer[node];
    let mut at = node + 1;
    if header & flags::HIGH_HAS_OUTPUT != 0 {
        at += K::BYTES;
    }
    let default = if header & flags::HIGH_HAS_DEFAULT != 0 {
        let id = read_id::<K>(buffer, at)?;
        at += K::BYTES;
        Some(id)
    } else {
        None
    };
    let advance_bitmap = if header & flags::HIGH_HAS_NONADVANCING != 0 {
        let bitmap = read_bytes(buffer, at, 32)?;
        at += 32;
        Some(bitmap)
    } else {
        None
    };
    let target_bitmap = if header & flags::HIGH_HAS_TARGET_BM != 0 {
        let bitmap = read_bytes(buffer, at, 32)?;
        at += 32;
        Some(bitmap)
    } else {
        None
    };
    let ali_bitmap = if header & flags::HIGH_HAS_ALI_BM != 0 {
        let bitmap = read_bytes(buffer, at, 32)?;
        at += 32;
        Some(bitmap)
    } else {
        None
    };

    let served = target_bitmap.map_or(true, |bitmap| bitmap_contains(bitmap, value));
    if !served {
        return Ok(match default {
            Some(target) => Next::Transition {
                target,
                advance: header & flags::HIGH_ADVANCE_ON_DEFAULT != 0,
            },
            None => Next::End,
        });
    }
    let index = if let Some(bitmap) = ali_bitmap {
        let rank = bitmap_rank(bitmap, value);
        if rank == 0 {
            return Err(EngineError::Invalid(
                "served input precedes every target run".into(),
            ));
        }
        (rank - 1) as usize
    } else if let Some(bitmap) = target_bitmap {
        (bitmap_rank(bitmap, value) - 1) as usize
    } else {
        value as usize
    };
    let target = read_id::<K>(buffer, at + index * K::BYTES)?;
    let advance = match advance_bitmap {
        Some(bitmap) => !bitmap_contains(bitmap, value),
        None => true,
    };
    Ok(Next::Transition { target, advance })
}

struct PcNode<'b> {
    default: Option<u64>,
    advance_on_default: bool,
    advance_on_final: bool,
    final_target: u64,
    path: &'b [u8],
}

fn decode_pc<K: IdKind>(buffer: &[u8], node: usize) -> Result<PcNode<'_>, EngineError> {
    let header = buffer[node];
    let mut at = node + 1;
    if header & flags::PC_HAS_OUTPUT != 0 {
        at += K::BYTES;
    }
    let default = if header & flags::PC_HAS_DEFAULT != 0 {
        let id = read_id::<K>(buffer, at)?;
        at += K::BYTES;
        Some(id)
    } else {
        None
    };
    let length_code = (header & flags::PC_LENGTH_MASK) >> flags::PC_LENGTH_SHIFT;
    let length = if length_code == flags::PC_LENGTH_EXPLICIT {
        let length = *buffer.get(at).ok_or_else(truncated)?;
        at += 1;
        length as usize
    } else {
        length_code as usize + 2
    };
    let final_target = read_id::<K>(buffer, at)?;
    at += K::BYTES;
    let path = read_bytes(buffer, at, length)?;
    Ok(PcNode {
        default,
        advance_on_default: header & flags::PC_ADVANCE_ON_DEFAULT != 0,
        advance_on_final: header & flags::PC_ADVANCE_ON_FINAL != 0,
        final_target,
        path,
    })
}

/// Per-stream execution state. Holds the current node, the cumulative input
/// location, and the progress inside a partially matched path-compressed
/// node, so a stream may be fed in arbitrary chunks.
pub struct State<'e> {
    engine: &'e Engine,
    callback: Box<dyn FnMut(&[u8], u64) -> Command + 'e>,
    node: u64,
    path_pos: usize,
    location: u64,
}

impl<'e> State<'e> {
    /// Total bytes consumed since the state was created.
    pub fn location(&self) -> u64 {
        self.location
    }

    /// Advances the state across the input, emitting outputs. Passing `None`
    /// re-emits the outputs of the current node and returns; this resumes a
    /// stream paused by a callback stop.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Invalid`] on a malformed image and
    /// [`EngineError::Callback`] if the callback aborts.
    pub fn execute(&mut self, input: Option<&[u8]>) -> Result<ExecuteStatus, EngineError> {
        self.run(input, true)
    }

    /// Advances the state across the input without emitting outputs.
    pub fn execute_without_output(&mut self, input: &[u8]) -> Result<ExecuteStatus, EngineError> {
        self.run(Some(input), false)
    }

    fn run(&mut self, input: Option<&[u8]>, with_output: bool) -> Result<ExecuteStatus, EngineError> {
        match self.engine.header.id_width {
            IdWidth::W1 => self.run_width::<Id1>(input, with_output),
            IdWidth::W2 => self.run_width::<Id2>(input, with_output),
            IdWidth::W4 => self.run_width::<Id4>(input, with_output),
            IdWidth::W8 => self.run_width::<Id8>(input, with_output),
        }
    }

    fn run_width<K: IdKind>(
        &mut self,
        input: Option<&[u8]>,
        with_output: bool,
    ) -> Result<ExecuteStatus, EngineError> {
        let engine = self.engine;
        let Some(input) = input else {
            return match self.emit_outputs::<K>(true, with_output, true)? {
                Command::Error => Err(EngineError::Callback),
                Command::Stop => Ok(ExecuteStatus::Stop),
                Command::Continue => Ok(ExecuteStatus::Ok),
            };
        };
        let mut pos = 0;
        loop {
            if pos >= input.len() {
                return Ok(ExecuteStatus::Ok);
            }
            let value = input[pos];
            let node = self.node as usize;
            let header = *engine.buffer.get(node).ok_or_else(truncated)?;
            let kind = NodeKind::from_header(header)
                .ok_or_else(|| EngineError::Invalid(format!("unknown node kind at {}", node)))?;
            let (transition, advanced) = match kind {
                NodeKind::Low | NodeKind::High => {
                    let next = if kind == NodeKind::Low {
                        next_low::<K>(&engine.buffer, node, value)?
                    } else {
                        next_high::<K>(&engine.buffer, node, value)?
                    };
                    match next {
                        Next::End => return Ok(ExecuteStatus::End),
                        Next::Transition { target, advance } => {
                            if advance {
                                pos += 1;
                                self.location += 1;
                            }
                            (target, advance)
                        }
                    }
                }
                NodeKind::Pc => {
                    let pc = decode_pc::<K>(&engine.buffer, node)?;
                    let mut matched = true;
                    let mut i = self.path_pos;
                    while i < pc.path.len() {
                        if pos >= input.len() {
                            // input exhausted mid-path; park inside the node
                            self.path_pos = i;
                            return Ok(ExecuteStatus::Ok);
                        }
                        if input[pos] != pc.path[i] {
                            matched = false;
                            break;
                        }
                        let last = i + 1 == pc.path.len();
                        if !last || pc.advance_on_final {
                            pos += 1;
                            self.location += 1;
                        }
                        i += 1;
                    }
                    self.path_pos = 0;
                    if matched {
                        (pc.final_target, pc.advance_on_final)
                    } else {
                        match pc.default {
                            None => return Ok(ExecuteStatus::End),
                            Some(target) => {
                                if pc.advance_on_default {
                                    pos += 1;
                                    self.location += 1;
                                }
                                (target, pc.advance_on_default)
                            }
                        }
                    }
                }
            };
            self.node = transition;
            match self.emit_outputs::<K>(advanced, with_output, false)? {
                Command::Continue => {}
                Command::Stop => return Ok(ExecuteStatus::Stop),
                Command::Error => return Err(EngineError::Callback),
            }
        }
    }

    fn emit_current(&mut self, with_output: bool) -> Result<Command, EngineError> {
        match self.engine.header.id_width {
            IdWidth::W1 => self.emit_outputs::<Id1>(true, with_output, true),
            IdWidth::W2 => self.emit_outputs::<Id2>(true, with_output, true),
            IdWidth::W4 => self.emit_outputs::<Id4>(true, with_output, true),
            IdWidth::W8 => self.emit_outputs::<Id8>(true, with_output, true),
        }
    }

    /// Emits the output chain of the current node. Emission is suppressed
    /// when outputs are disabled for this run, or when the automaton carries
    /// the no-advance-no-output flag and this step did not consume input
    /// (unless `unconditional`, used for creation and resume).
    fn emit_outputs<K: IdKind>(
        &mut self,
        advanced: bool,
        with_output: bool,
        unconditional: bool,
    ) -> Result<Command, EngineError> {
        if !with_output {
            return Ok(Command::Continue);
        }
        let engine = self.engine;
        if !unconditional && engine.header.no_advance_no_output && !advanced {
            return Ok(Command::Continue);
        }
        let node = self.node as usize;
        let header = *engine.buffer.get(node).ok_or_else(truncated)?;
        // bit 0 is the output flag for every node kind
        if header & flags::LOW_HAS_OUTPUT == 0 {
            return Ok(Command::Continue);
        }
        let mut id = read_id::<K>(&engine.buffer, node + 1)?;
        let mut remaining = engine.header.num_outputs + engine.header.num_output_lists + 1;
        loop {
            if remaining == 0 {
                return Err(EngineError::Invalid(
                    "output chain does not terminate".into(),
                ));
            }
            remaining -= 1;
            if id < engine.header.first_output {
                return Err(EngineError::Invalid(format!(
                    "output id {} precedes the output region",
                    id
                )));
            }
            let (content_id, next) = if id < engine.header.first_output_list {
                (id, None)
            } else {
                let content_id = read_id::<K>(&engine.buffer, id as usize)?;
                let next = read_id::<K>(&engine.buffer, id as usize + K::BYTES)?;
                (content_id, Some(next))
            };
            let mut at = content_id as usize;
            let content = engine.read_content(&mut at)?;
            match (self.callback)(content, self.location) {
                Command::Continue => {}
                other => return Ok(other),
            }
            match next {
                Some(next) => id = next,
                None => return Ok(Command::Continue),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eudoxus::{EUDOXUS_VERSION, HEADER_LEN};

    fn minimal_image() -> Vec<u8> {
        let header = Header {
            id_width: IdWidth::W1,
            is_big_endian: cfg!(target_endian = "big"),
            no_advance_no_output: false,
            num_nodes: 1,
            num_outputs: 0,
            num_output_lists: 0,
            num_metadata: 0,
            data_length: HEADER_LEN as u64 + 1,
            start_index: HEADER_LEN as u64,
            first_output: HEADER_LEN as u64 + 1,
            first_output_list: HEADER_LEN as u64 + 1,
            metadata_index: HEADER_LEN as u64 + 1,
        };
        let mut image = vec![0; HEADER_LEN + 1];
        header.encode(&mut image);
        // a low node with no output, no default and no edges
        image[HEADER_LEN] = 0;
        image
    }

    #[test]
    fn loads_minimal_image() {
        let engine = Engine::load(minimal_image()).unwrap();
        assert_eq!(engine.header().num_nodes, 1);
        let mut state = engine.create_state(|_, _| Command::Continue).unwrap();
        assert_eq!(state.execute(Some(b"x")).unwrap(), ExecuteStatus::End);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut image = minimal_image();
        image[0] = EUDOXUS_VERSION + 1;
        assert!(matches!(
            Engine::load(image),
            Err(EngineError::Incompatible(_))
        ));
    }

    #[test]
    fn rejects_foreign_endianness() {
        let mut image = minimal_image();
        image[2] = u8::from(!cfg!(target_endian = "big"));
        assert!(matches!(
            Engine::load(image),
            Err(EngineError::Incompatible(_))
        ));
    }

    #[test]
    fn rejects_bad_id_width() {
        let mut image = minimal_image();
        image[1] = 3;
        assert!(matches!(Engine::load(image), Err(EngineError::Invalid(_))));
    }

    #[test]
    fn rejects_truncated_image() {
        let mut image = minimal_image();
        image.pop();
        assert!(matches!(Engine::load(image), Err(EngineError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_node_kind() {
        let mut image = minimal_image();
        image[HEADER_LEN] = 3 << 6;
        let engine = Engine::load(image).unwrap();
        let mut state = engine.create_state(|_, _| Command::Continue).unwrap();
        assert!(matches!(
            state.execute(Some(b"x")),
            Err(EngineError::Invalid(_))
        ));
    }
}
