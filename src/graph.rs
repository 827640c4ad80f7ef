//! Weighted automaton storage shared between the caller and every graph
//! derived from it.

use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{
    device::Device,
    error::{GraphError, IndexKind, Result},
    tape::GradTape,
};

/// Arc label meaning "no symbol".
pub const EPSILON: i32 = -1;

#[derive(Clone, Debug, Default)]
struct Node {
    start: bool,
    accept: bool,
    in_arcs: Vec<usize>,
    out_arcs: Vec<usize>,
}

#[derive(Clone, Copy, Debug)]
struct ArcEntry {
    src: usize,
    dst: usize,
    label: i32,
}

/// Topology of a graph. Weights live next to it in their own lock so that
/// they stay writable after the topology is frozen.
#[derive(Default, Debug)]
struct GraphStore {
    nodes: Vec<Node>,
    arcs: Vec<ArcEntry>,
    start: Vec<usize>,
    accept: Vec<usize>,
}

impl GraphStore {
    fn node(&self, idx: usize) -> Result<&Node> {
        self.nodes.get(idx).ok_or(GraphError::InvalidIndex {
            kind: IndexKind::Node,
            index: idx,
            len: self.nodes.len(),
        })
    }

    fn node_mut(&mut self, idx: usize) -> Result<&mut Node> {
        let len = self.nodes.len();
        self.nodes.get_mut(idx).ok_or(GraphError::InvalidIndex {
            kind: IndexKind::Node,
            index: idx,
            len,
        })
    }

    fn arc(&self, idx: usize) -> Result<&ArcEntry> {
        self.arcs.get(idx).ok_or(GraphError::InvalidIndex {
            kind: IndexKind::Arc,
            index: idx,
            len: self.arcs.len(),
        })
    }
}

pub(crate) struct GraphPayload {
    device: Device,
    store: RwLock<GraphStore>,
    weights: RwLock<Vec<f32>>,
    frozen: AtomicBool,
    pub(crate) calc_grad: AtomicBool,
    pub(crate) grad: Mutex<Option<Vec<f32>>>,
    pub(crate) tape: Mutex<Option<GradTape>>,
}

impl Drop for GraphPayload {
    fn drop(&mut self) {
        // Unlink ancestors iteratively so that dropping a long derivation
        // chain does not recurse once per graph.
        let mut stack: Vec<Graph> = self
            .tape
            .get_mut()
            .take()
            .map(|tape| tape.inputs)
            .unwrap_or_default();
        while let Some(graph) = stack.pop() {
            if let Ok(mut payload) = Arc::try_unwrap(graph.0) {
                if let Some(tape) = payload.tape.get_mut().take() {
                    stack.extend(tape.inputs);
                }
            }
        }
    }
}

/// A weighted automaton.
///
/// Cloning a `Graph` is cheap and yields another handle to the same storage;
/// the storage lives until the last handle, whether held by a caller or by a
/// derived graph's tape, is dropped.
#[derive(Clone)]
pub struct Graph(pub(crate) Arc<GraphPayload>);

impl Graph {
    pub fn new(calc_grad: bool) -> Self {
        Self::with_device(Device::Cpu, calc_grad)
    }

    pub fn with_device(device: Device, calc_grad: bool) -> Self {
        Self(Arc::new(GraphPayload {
            device,
            store: RwLock::new(GraphStore::default()),
            weights: RwLock::new(vec![]),
            frozen: AtomicBool::new(false),
            calc_grad: AtomicBool::new(calc_grad),
            grad: Mutex::new(None),
            tape: Mutex::new(None),
        }))
    }

    /// Creates the empty output graph of an operator consuming `inputs`.
    ///
    /// Gradient tracking is on iff any input tracks gradients. The flag is
    /// read once, here.
    pub fn derived(inputs: &[Graph], device: Device) -> Self {
        let calc_grad = inputs.iter().any(|input| input.calc_grad());
        Self::with_device(device, calc_grad)
    }

    pub fn device(&self) -> Device {
        self.0.device
    }

    /// Identity of the underlying storage, shared by all clones of a handle.
    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Whether both handles refer to the same storage.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_frozen(&self) -> bool {
        self.0.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn freeze(&self) {
        self.0.frozen.store(true, Ordering::Release);
    }

    fn check_mutable(&self) -> Result<()> {
        if self.is_frozen() {
            Err(GraphError::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn add_node(&self, start: bool, accept: bool) -> Result<usize> {
        self.check_mutable()?;
        Ok(self.push_node(start, accept))
    }

    pub(crate) fn push_node(&self, start: bool, accept: bool) -> usize {
        let mut store = self.0.store.write();
        let idx = store.nodes.len();
        store.nodes.push(Node {
            start,
            accept,
            ..Node::default()
        });
        if start {
            store.start.push(idx);
        }
        if accept {
            store.accept.push(idx);
        }
        idx
    }

    /// Adds an arc with zero weight.
    pub fn add_arc(&self, src: usize, dst: usize, label: i32) -> Result<usize> {
        self.add_arc_with_weight(src, dst, label, 0.)
    }

    /// Adds an arc. Parallel arcs, self loops and unreachable nodes are all
    /// accepted.
    pub fn add_arc_with_weight(
        &self,
        src: usize,
        dst: usize,
        label: i32,
        weight: f32,
    ) -> Result<usize> {
        self.check_mutable()?;
        {
            let store = self.0.store.read();
            store.node(src)?;
            store.node(dst)?;
        }
        Ok(self.push_arc(src, dst, label, weight))
    }

    /// Appends an arc between nodes known to exist.
    pub(crate) fn push_arc(&self, src: usize, dst: usize, label: i32, weight: f32) -> usize {
        let mut store = self.0.store.write();
        let idx = store.arcs.len();
        store.arcs.push(ArcEntry { src, dst, label });
        store.nodes[src].out_arcs.push(idx);
        store.nodes[dst].in_arcs.push(idx);
        self.0.weights.write().push(weight);
        idx
    }

    /// Marks an existing node as a start node.
    pub fn make_start(&self, node: usize) -> Result<()> {
        self.check_mutable()?;
        let mut store = self.0.store.write();
        let entry = store.node_mut(node)?;
        if !entry.start {
            entry.start = true;
            store.start.push(node);
        }
        Ok(())
    }

    /// Marks an existing node as an accept node.
    pub fn make_accept(&self, node: usize) -> Result<()> {
        self.check_mutable()?;
        let mut store = self.0.store.write();
        let entry = store.node_mut(node)?;
        if !entry.accept {
            entry.accept = true;
            store.accept.push(node);
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> usize {
        self.0.store.read().nodes.len()
    }

    pub fn num_arcs(&self) -> usize {
        self.0.store.read().arcs.len()
    }

    pub fn num_start(&self) -> usize {
        self.0.store.read().start.len()
    }

    pub fn num_accept(&self) -> usize {
        self.0.store.read().accept.len()
    }

    /// Start nodes in the order they were marked.
    pub fn start(&self) -> Vec<usize> {
        self.0.store.read().start.clone()
    }

    /// Accept nodes in the order they were marked.
    pub fn accept(&self) -> Vec<usize> {
        self.0.store.read().accept.clone()
    }

    pub fn is_start(&self, node: usize) -> Result<bool> {
        Ok(self.0.store.read().node(node)?.start)
    }

    pub fn is_accept(&self, node: usize) -> Result<bool> {
        Ok(self.0.store.read().node(node)?.accept)
    }

    pub fn in_arcs(&self, node: usize) -> Result<Vec<usize>> {
        Ok(self.0.store.read().node(node)?.in_arcs.clone())
    }

    pub fn out_arcs(&self, node: usize) -> Result<Vec<usize>> {
        Ok(self.0.store.read().node(node)?.out_arcs.clone())
    }

    pub fn num_in(&self, node: usize) -> Result<usize> {
        Ok(self.0.store.read().node(node)?.in_arcs.len())
    }

    pub fn num_out(&self, node: usize) -> Result<usize> {
        Ok(self.0.store.read().node(node)?.out_arcs.len())
    }

    pub fn src_node(&self, arc: usize) -> Result<usize> {
        Ok(self.0.store.read().arc(arc)?.src)
    }

    pub fn dst_node(&self, arc: usize) -> Result<usize> {
        Ok(self.0.store.read().arc(arc)?.dst)
    }

    pub fn label(&self, arc: usize) -> Result<i32> {
        Ok(self.0.store.read().arc(arc)?.label)
    }

    pub fn weight(&self, arc: usize) -> Result<f32> {
        let weights = self.0.weights.read();
        weights.get(arc).copied().ok_or(GraphError::InvalidIndex {
            kind: IndexKind::Arc,
            index: arc,
            len: weights.len(),
        })
    }

    /// All weights in arc order.
    ///
    /// Returns a copy, so the result can be handed straight back to
    /// [`set_weights`](Self::set_weights) on the same graph.
    pub fn weights(&self) -> Vec<f32> {
        self.0.weights.read().clone()
    }

    /// Overwrites every weight. Allowed on frozen graphs.
    pub fn set_weights(&self, values: &[f32]) -> Result<()> {
        let mut weights = self.0.weights.write();
        if values.len() != weights.len() {
            return Err(GraphError::DimensionMismatch {
                expected: weights.len(),
                actual: values.len(),
            });
        }
        weights.copy_from_slice(values);
        Ok(())
    }

    /// The weight of the only arc.
    pub fn item(&self) -> Result<f32> {
        let weights = self.0.weights.read();
        match weights.as_slice() {
            [weight] => Ok(*weight),
            _ => Err(GraphError::ShapeError {
                expected: 1,
                actual: weights.len(),
            }),
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("device", &self.0.device)
            .field("num_nodes", &self.num_nodes())
            .field("num_arcs", &self.num_arcs())
            .field("calc_grad", &self.calc_grad())
            .field("frozen", &self.is_frozen())
            .field("tape", &*self.0.tape.lock())
            .finish()
    }
}

/// Plain text dump: start nodes, accept nodes, then `src dst label weight`
/// per arc.
impl Display for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.0.store.read();
        let weights = self.0.weights.read();
        let join = |nodes: &[usize]| {
            nodes
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(" ")
        };
        writeln!(f, "{}", join(&store.start))?;
        writeln!(f, "{}", join(&store.accept))?;
        for (arc, weight) in store.arcs.iter().zip(weights.iter()) {
            writeln!(f, "{} {} {} {}", arc.src, arc.dst, arc.label, weight)?;
        }
        Ok(())
    }
}
