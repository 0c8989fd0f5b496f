//! The on-disk envelope for intermediate automata: a stream of size-prefixed
//! records describing the graph, its nodes and its outputs.
//!
//! Each record is a 32-bit little-endian length followed by a JSON document.
//! Byte strings travel hex-encoded. The reader validates id uniqueness,
//! resolves references once the stream ends, and reports unreferenced
//! entries as warnings through a caller-supplied sink.

use std::collections::HashMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::intermediate::{Automaton, Edge, EdgeValues, NodeId, OutputId};

/// Upper bound on a single record body, guarding against corrupt prefixes.
const MAX_RECORD_LEN: u32 = 1 << 26;

/// An error raised while reading or writing an envelope stream.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record of {0} bytes exceeds the record size limit")]
    RecordTooLarge(u32),
    #[error("truncated record stream")]
    Truncated,
    #[error("duplicate node id {0}")]
    DuplicateNode(u32),
    #[error("duplicate output id {0}")]
    DuplicateOutput(u32),
    #[error("reference to unknown node id {0}")]
    DanglingNode(u32),
    #[error("reference to unknown output id {0}")]
    DanglingOutput(u32),
    #[error("stream declares no nodes")]
    MissingStart,
    #[error("invalid hex string {0:?}")]
    BadHex(String),
}

/// Classification of reader diagnostics: errors abort, warnings continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

/// A successfully read automaton plus a cleanliness flag; `clean` is false
/// when the stream produced warnings.
pub struct ReadResult {
    pub automaton: Automaton,
    pub clean: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Graph(GraphRecord),
    Node(NodeRecord),
    Output(OutputRecord),
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphRecord {
    #[serde(default)]
    no_advance_no_output: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    metadata: Vec<MetadataRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataRecord {
    key: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_output: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default_target: Option<u32>,
    #[serde(default = "default_true")]
    advance_on_default: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRecord {
    target: u32,
    #[serde(default = "default_true")]
    advance: bool,
    /// Hex-encoded input values; absent for an epsilon edge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OutputRecord {
    id: u32,
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    next: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn to_hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(2 * bytes.len());
    for byte in bytes {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

fn from_hex(hex: &str) -> Result<Vec<u8>, EnvelopeError> {
    if hex.len() % 2 != 0 {
        return Err(EnvelopeError::BadHex(hex.to_owned()));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let digits = std::str::from_utf8(pair).map_err(|_| ())?;
            u8::from_str_radix(digits, 16).map_err(|_| ())
        })
        .collect::<Result<Vec<u8>, ()>>()
        .map_err(|()| EnvelopeError::BadHex(hex.to_owned()))
}

fn write_record<W: Write>(writer: &mut W, record: &Record) -> Result<(), EnvelopeError> {
    let body = serde_json::to_vec(record)?;
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    Ok(())
}

/// Writes an automaton as an envelope stream: the graph record, then nodes
/// in id order, then outputs in id order.
pub fn write_automaton<W: Write>(
    automaton: &Automaton,
    writer: &mut W,
) -> Result<(), EnvelopeError> {
    write_record(
        writer,
        &Record::Graph(GraphRecord {
            no_advance_no_output: automaton.no_advance_no_output,
            start: Some(automaton.start().index() as u32),
            metadata: automaton
                .metadata()
                .iter()
                .map(|(key, value)| MetadataRecord {
                    key: to_hex(key),
                    value: to_hex(value),
                })
                .collect(),
        }),
    )?;
    for id in automaton.node_ids() {
        let node = &automaton[id];
        write_record(
            writer,
            &Record::Node(NodeRecord {
                id: id.index() as u32,
                first_output: node.first_output.map(|output| output.index() as u32),
                default_target: node.default_target.map(|target| target.index() as u32),
                advance_on_default: node.advance_on_default,
                edges: node
                    .edges
                    .iter()
                    .map(|edge| EdgeRecord {
                        target: edge.target.index() as u32,
                        advance: edge.advance,
                        values: match edge.values {
                            EdgeValues::Epsilon => None,
                            _ => Some(to_hex(&edge.values().collect::<Vec<u8>>())),
                        },
                    })
                    .collect(),
            }),
        )?;
    }
    for id in automaton.output_ids() {
        let output = &automaton[id];
        write_record(
            writer,
            &Record::Output(OutputRecord {
                id: id.index() as u32,
                content: to_hex(&output.content),
                next: output.next.map(|next| next.index() as u32),
            }),
        )?;
    }
    Ok(())
}

/// Outcome of filling a fixed-size buffer from a reader.
enum Fill {
    Full,
    Eof,
}

/// Reads exactly `buffer.len()` bytes, distinguishing a clean end of stream
/// (no bytes available) from a truncated one.
fn fill<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<Fill, EnvelopeError> {
    let mut have = 0;
    while have < buffer.len() {
        let read = reader.read(&mut buffer[have..])?;
        if read == 0 {
            return if have == 0 {
                Ok(Fill::Eof)
            } else {
                Err(EnvelopeError::Truncated)
            };
        }
        have += read;
    }
    Ok(Fill::Full)
}

fn read_records<R: Read>(reader: &mut R) -> Result<Vec<Record>, EnvelopeError> {
    let mut records = Vec::new();
    loop {
        let mut length_bytes = [0_u8; 4];
        match fill(reader, &mut length_bytes)? {
            Fill::Eof => return Ok(records),
            Fill::Full => {}
        }
        let length = u32::from_le_bytes(length_bytes);
        if length > MAX_RECORD_LEN {
            return Err(EnvelopeError::RecordTooLarge(length));
        }
        let mut body = vec![0; length as usize];
        match fill(reader, &mut body)? {
            Fill::Eof => return Err(EnvelopeError::Truncated),
            Fill::Full => {}
        }
        records.push(serde_json::from_slice(&body)?);
    }
}

/// Reads an envelope stream, logging diagnostics through the `log` crate.
pub fn read_automaton<R: Read>(reader: &mut R) -> Result<ReadResult, EnvelopeError> {
    read_automaton_with(reader, |severity, message| match severity {
        Severity::Warning => log::warn!("{}", message),
        Severity::Error => log::error!("{}", message),
    })
}

/// Reads an envelope stream, reporting warnings and errors through the given
/// sink. Errors additionally abort the read; warnings only clear the
/// `clean` flag of the result.
pub fn read_automaton_with<R: Read, F: FnMut(Severity, &str)>(
    reader: &mut R,
    mut sink: F,
) -> Result<ReadResult, EnvelopeError> {
    let records = read_records(reader)?;
    let mut error = |sink: &mut F, e: EnvelopeError| {
        sink(Severity::Error, &e.to_string());
        e
    };

    // register ids before resolving any reference
    let mut node_records = Vec::new();
    let mut output_records = Vec::new();
    let mut start_external = None;
    let mut no_advance_no_output = false;
    let mut metadata = Vec::new();
    for record in records {
        match record {
            Record::Graph(graph) => {
                no_advance_no_output = graph.no_advance_no_output;
                if graph.start.is_some() {
                    start_external = graph.start;
                }
                metadata.extend(graph.metadata);
            }
            Record::Node(node) => node_records.push(node),
            Record::Output(output) => output_records.push(output),
        }
    }
    let start_external = match start_external.or_else(|| node_records.first().map(|n| n.id)) {
        Some(id) => id,
        None => return Err(error(&mut sink, EnvelopeError::MissingStart)),
    };

    let mut automaton = Automaton::new();
    automaton.no_advance_no_output = no_advance_no_output;
    for entry in metadata {
        automaton.set_metadata(from_hex(&entry.key)?, from_hex(&entry.value)?);
    }

    let mut node_map: HashMap<u32, NodeId> = HashMap::new();
    for record in &node_records {
        let id = if record.id == start_external {
            automaton.start()
        } else {
            automaton.add_node()
        };
        if node_map.insert(record.id, id).is_some() {
            return Err(error(&mut sink, EnvelopeError::DuplicateNode(record.id)));
        }
    }
    if !node_map.contains_key(&start_external) {
        return Err(error(&mut sink, EnvelopeError::DanglingNode(start_external)));
    }
    let mut output_map: HashMap<u32, OutputId> = HashMap::new();
    for record in &output_records {
        let id = automaton.add_output(from_hex(&record.content)?, None);
        if output_map.insert(record.id, id).is_some() {
            return Err(error(&mut sink, EnvelopeError::DuplicateOutput(record.id)));
        }
    }

    let resolve_node = |external: u32| node_map.get(&external).copied();
    let resolve_output = |external: u32| output_map.get(&external).copied();

    for record in &node_records {
        let id = node_map[&record.id];
        if let Some(external) = record.first_output {
            let output = match resolve_output(external) {
                Some(output) => output,
                None => return Err(error(&mut sink, EnvelopeError::DanglingOutput(external))),
            };
            automaton[id].first_output = Some(output);
        }
        if let Some(external) = record.default_target {
            let target = match resolve_node(external) {
                Some(target) => target,
                None => return Err(error(&mut sink, EnvelopeError::DanglingNode(external))),
            };
            automaton[id].default_target = Some(target);
        }
        automaton[id].advance_on_default = record.advance_on_default;
        for edge_record in &record.edges {
            let target = match resolve_node(edge_record.target) {
                Some(target) => target,
                None => {
                    return Err(error(&mut sink, EnvelopeError::DanglingNode(edge_record.target)))
                }
            };
            let mut edge = Edge::epsilon(target, edge_record.advance);
            if let Some(hex) = &edge_record.values {
                let mut values = tinyvec::TinyVec::new();
                values.extend(from_hex(hex)?);
                edge.values = EdgeValues::Vector(values);
            }
            automaton[id].edges.push(edge);
        }
    }
    for record in &output_records {
        if let Some(external) = record.next {
            let next = match resolve_output(external) {
                Some(next) => next,
                None => return Err(error(&mut sink, EnvelopeError::DanglingOutput(external))),
            };
            let id = output_map[&record.id];
            automaton[id].next = Some(next);
        }
    }

    // warn on entries nothing references
    let mut clean = true;
    let mut reachable = vec![false; automaton.num_nodes()];
    automaton.breadth_first(|id| reachable[id.index()] = true);
    for record in &node_records {
        let id = node_map[&record.id];
        if !reachable[id.index()] {
            clean = false;
            sink(
                Severity::Warning,
                &format!("node id {} is unreachable from the start node", record.id),
            );
        }
    }
    let mut referenced = vec![false; automaton.num_outputs()];
    for id in automaton.node_ids() {
        let mut current = automaton[id].first_output;
        while let Some(output) = current {
            if referenced[output.index()] {
                break;
            }
            referenced[output.index()] = true;
            current = automaton[output].next;
        }
    }
    for record in &output_records {
        let id = output_map[&record.id];
        if !referenced[id.index()] {
            clean = false;
            sink(
                Severity::Warning,
                &format!("output id {} is never referenced", record.id),
            );
        }
    }

    Ok(ReadResult { automaton, clean })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_automaton() -> Automaton {
        let mut automaton = Automaton::new();
        let start = automaton.start();
        let hit = automaton.add_node();
        let tail = automaton.add_output(b"tail".to_vec(), None);
        let head = automaton.add_output(b"head".to_vec(), Some(tail));
        automaton[hit].first_output = Some(head);
        automaton[start].edges.push(Edge::single(hit, true, b'a'));
        automaton[start].default_target = Some(start);
        automaton.set_metadata(b"name".to_vec(), b"sample".to_vec());
        automaton
    }

    #[test]
    fn hex_round_trip() {
        assert_eq!(to_hex(&[0, 15, 255]), "000fff");
        assert_eq!(from_hex("000fff").unwrap(), vec![0, 15, 255]);
        assert!(from_hex("0").is_err());
        assert!(from_hex("zz").is_err());
    }

    #[test]
    fn stream_round_trip() {
        let automaton = sample_automaton();
        let mut stream = Vec::new();
        write_automaton(&automaton, &mut stream).unwrap();
        let result = read_automaton(&mut stream.as_slice()).unwrap();
        assert!(result.clean);
        let read = result.automaton;
        assert_eq!(read.num_nodes(), automaton.num_nodes());
        assert_eq!(read.num_outputs(), automaton.num_outputs());
        assert_eq!(read.metadata(), automaton.metadata());
        let start = read.start();
        assert_eq!(read[start].edges.len(), 1);
        assert_eq!(read[start].default_target, Some(start));
        let hit = read[start].edges[0].target;
        let head = read[hit].first_output.unwrap();
        assert_eq!(read[head].content, b"head");
        let tail = read[head].next.unwrap();
        assert_eq!(read[tail].content, b"tail");
        assert_eq!(read[tail].next, None);
    }

    #[test]
    fn duplicate_node_id_is_an_error() {
        let mut stream = Vec::new();
        let node = Record::Node(NodeRecord {
            id: 0,
            first_output: None,
            default_target: None,
            advance_on_default: true,
            edges: Vec::new(),
        });
        write_record(&mut stream, &node).unwrap();
        write_record(&mut stream, &node).unwrap();
        assert!(matches!(
            read_automaton(&mut stream.as_slice()),
            Err(EnvelopeError::DuplicateNode(0))
        ));
    }

    #[test]
    fn dangling_edge_target_is_an_error() {
        let mut stream = Vec::new();
        let node = Record::Node(NodeRecord {
            id: 0,
            first_output: None,
            default_target: None,
            advance_on_default: true,
            edges: vec![EdgeRecord {
                target: 7,
                advance: true,
                values: Some("61".into()),
            }],
        });
        write_record(&mut stream, &node).unwrap();
        assert!(matches!(
            read_automaton(&mut stream.as_slice()),
            Err(EnvelopeError::DanglingNode(7))
        ));
    }

    #[test]
    fn unreferenced_output_warns_but_reads() {
        let mut automaton = sample_automaton();
        automaton.add_output(b"orphan".to_vec(), None);
        let mut stream = Vec::new();
        write_automaton(&automaton, &mut stream).unwrap();
        let mut warnings = Vec::new();
        let result = read_automaton_with(&mut stream.as_slice(), |severity, message| {
            warnings.push((severity, message.to_owned()));
        })
        .unwrap();
        assert!(!result.clean);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].0, Severity::Warning);
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let automaton = sample_automaton();
        let mut stream = Vec::new();
        write_automaton(&automaton, &mut stream).unwrap();
        stream.truncate(stream.len() - 3);
        assert!(matches!(
            read_automaton(&mut stream.as_slice()),
            Err(EnvelopeError::Truncated)
        ));
    }

    #[test]
    fn empty_stream_has_no_start() {
        let mut empty: &[u8] = &[];
        assert!(matches!(
            read_automaton(&mut empty),
            Err(EnvelopeError::MissingStart)
        ));
    }
}
