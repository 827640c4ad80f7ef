//! Reverse-mode differentiation over graphs derived from other graphs.
//!
//! Every graph produced by an operator records the graphs it consumed and a
//! function mapping its own arc gradient to one gradient per consumed graph.
//! The records form a DAG (a graph may feed many consumers), so propagation
//! is driven by a worklist that holds each graph back until all of its
//! consumers have delivered.

use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    sync::{atomic::Ordering, Arc},
};

use log::{debug, trace};
use parking_lot::{const_mutex, Mutex};

use crate::{
    error::{GraphError, Result},
    graph::Graph,
};

/// Maps the gradient of an output graph's arcs to the gradient of each
/// input's arcs.
///
/// Implemented for every closure `Fn(&[Graph], &[f32]) -> Vec<Vec<f32>>`.
/// The returned vector holds one entry per input, in input order, each as
/// long as that input's arc count.
pub trait GradFn: Send + Sync {
    fn backward(&self, inputs: &[Graph], grad: &[f32]) -> Vec<Vec<f32>>;
}

impl<F> GradFn for F
where
    F: Fn(&[Graph], &[f32]) -> Vec<Vec<f32>> + Send + Sync,
{
    fn backward(&self, inputs: &[Graph], grad: &[f32]) -> Vec<Vec<f32>> {
        self(inputs, grad)
    }
}

/// Serializes attachment so that the cycle check and the tape it guards
/// are observed together by every other attach.
static ATTACH_LOCK: Mutex<()> = const_mutex(());

pub(crate) struct GradTape {
    pub(crate) inputs: Vec<Graph>,
    grad_fn: Arc<dyn GradFn>,
}

impl std::fmt::Debug for GradTape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradTape")
            .field("inputs", &self.inputs.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackwardOptions {
    /// Keep the recorded inputs and backward functions after propagation.
    /// When false, every graph visited forgets its tape, so a second
    /// backward pass stops at the root.
    pub retain_graph: bool,
}

impl Default for BackwardOptions {
    fn default() -> Self {
        Self { retain_graph: true }
    }
}

impl Graph {
    pub fn calc_grad(&self) -> bool {
        self.0.calc_grad.load(Ordering::Acquire)
    }

    /// Turns gradient tracking on or off. Turning it off drops the stored
    /// gradient.
    pub fn set_calc_grad(&self, calc_grad: bool) {
        self.0.calc_grad.store(calc_grad, Ordering::Release);
        if !calc_grad {
            self.zero_grad();
        }
    }

    /// Accumulated gradient, aligned with the arcs. `None` until some
    /// backward pass reaches this graph.
    pub fn grad(&self) -> Option<Vec<f32>> {
        self.0.grad.lock().clone()
    }

    pub fn zero_grad(&self) {
        *self.0.grad.lock() = None;
    }

    /// The graphs this one was computed from.
    pub fn inputs(&self) -> Vec<Graph> {
        self.0
            .tape
            .lock()
            .as_ref()
            .map(|tape| tape.inputs.clone())
            .unwrap_or_default()
    }

    pub fn is_leaf(&self) -> bool {
        self.0.tape.lock().is_none()
    }

    /// Records that this graph was computed from `inputs`.
    ///
    /// Fails with [`GraphError::CycleError`] if this graph is already an
    /// ancestor of one of `inputs`, and with [`GraphError::TapeAttached`] if
    /// a tape was attached before. On success the inputs' topology is frozen.
    /// Attaches on different graphs are serialized against each other.
    pub fn attach_backward<F>(&self, inputs: Vec<Graph>, backward_fn: F) -> Result<()>
    where
        F: Fn(&[Graph], &[f32]) -> Vec<Vec<f32>> + Send + Sync + 'static,
    {
        self.attach_grad_fn(inputs, Arc::new(backward_fn))
    }

    /// Like [`attach_backward`](Self::attach_backward) for a shared
    /// [`GradFn`] implementation.
    pub fn attach_grad_fn(&self, inputs: Vec<Graph>, grad_fn: Arc<dyn GradFn>) -> Result<()> {
        let _attach = ATTACH_LOCK.lock();
        if !self.is_leaf() {
            return Err(GraphError::TapeAttached);
        }
        if self.reachable_from(&inputs) {
            return Err(GraphError::CycleError);
        }

        let mut tape = self.0.tape.lock();
        for input in &inputs {
            input.freeze();
        }
        debug!(
            "attach_backward: graph {:#x} <- {} inputs",
            self.id(),
            inputs.len()
        );
        *tape = Some(GradTape { inputs, grad_fn });
        Ok(())
    }

    /// Whether this graph is one of `roots` or one of their ancestors.
    fn reachable_from(&self, roots: &[Graph]) -> bool {
        let me = self.id();
        if roots.iter().any(|root| root.id() == me) {
            return true;
        }
        // Only graphs already used as an input can appear in someone's tape.
        if !self.is_frozen() {
            return false;
        }
        let mut visited = HashSet::new();
        let mut stack: Vec<Graph> = roots.to_vec();
        while let Some(graph) = stack.pop() {
            if !visited.insert(graph.id()) {
                continue;
            }
            for input in graph.inputs() {
                if input.id() == me {
                    return true;
                }
                stack.push(input);
            }
        }
        false
    }

    /// Propagates `grad` back to every ancestor tracking gradients, keeping
    /// the tapes.
    pub fn backward(&self, grad: &[f32]) -> Result<()> {
        self.backward_with(grad, BackwardOptions::default())
    }

    pub fn backward_with(&self, grad: &[f32], options: BackwardOptions) -> Result<()> {
        let num_arcs = self.num_arcs();
        if grad.len() != num_arcs {
            return Err(GraphError::ShapeError {
                expected: num_arcs,
                actual: grad.len(),
            });
        }
        if !self.calc_grad() {
            trace!("backward: graph {:#x} does not track gradients", self.id());
            return Ok(());
        }

        let Plan { mut pending, tapes } = self.plan();
        debug!(
            "backward: graph {:#x} with {} ancestors",
            self.id(),
            pending.len()
        );

        let mut accum: HashMap<usize, Vec<f32>> = HashMap::new();
        accum.insert(self.id(), grad.to_vec());
        let mut ready = vec![self.clone()];
        // Nothing is stored until the whole pass succeeded.
        let mut deltas: Vec<(Graph, Vec<f32>)> = vec![];

        while let Some(graph) = ready.pop() {
            let Some(delta) = accum.remove(&graph.id()) else {
                continue;
            };
            trace!("backward: visiting graph {:#x}", graph.id());

            if let Some((inputs, grad_fn)) = tapes.get(&graph.id()) {
                let input_grads = grad_fn.backward(inputs, &delta);
                if input_grads.len() != inputs.len() {
                    return Err(GraphError::ShapeError {
                        expected: inputs.len(),
                        actual: input_grads.len(),
                    });
                }
                for (input, input_grad) in inputs.iter().zip(input_grads) {
                    if !input.calc_grad() {
                        continue;
                    }
                    let expected = input.num_arcs();
                    if input_grad.len() != expected {
                        return Err(GraphError::ShapeError {
                            expected,
                            actual: input_grad.len(),
                        });
                    }
                    match accum.entry(input.id()) {
                        Entry::Occupied(mut entry) => add_assign(entry.get_mut(), &input_grad),
                        Entry::Vacant(entry) => {
                            entry.insert(input_grad);
                        }
                    }
                    if let Some(count) = pending.get_mut(&input.id()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push(input.clone());
                        }
                    }
                }
            }

            deltas.push((graph, delta));
        }

        for (graph, delta) in &deltas {
            graph.add_grad(delta);
            if !options.retain_graph {
                let released = graph.0.tape.lock().take();
                drop(released);
            }
        }
        Ok(())
    }

    /// Captures the tape of every gradient-tracking graph reachable from
    /// this one, and how many consuming edges lead into each of them. An
    /// input listed twice by one consumer counts twice.
    fn plan(&self) -> Plan {
        let mut pending: HashMap<usize, usize> = HashMap::new();
        let mut tapes = HashMap::new();
        let mut visited = HashSet::from([self.id()]);
        let mut stack = vec![self.clone()];
        while let Some(graph) = stack.pop() {
            let snapshot = graph
                .0
                .tape
                .lock()
                .as_ref()
                .map(|tape| (tape.inputs.clone(), tape.grad_fn.clone()));
            let Some((inputs, grad_fn)) = snapshot else {
                continue;
            };
            for input in &inputs {
                if !input.calc_grad() {
                    continue;
                }
                *pending.entry(input.id()).or_default() += 1;
                if visited.insert(input.id()) {
                    stack.push(input.clone());
                }
            }
            tapes.insert(graph.id(), (inputs, grad_fn));
        }
        Plan { pending, tapes }
    }

    fn add_grad(&self, delta: &[f32]) {
        let mut grad = self.0.grad.lock();
        match grad.as_mut() {
            Some(grad) => add_assign(grad, delta),
            None => *grad = Some(delta.to_vec()),
        }
    }
}

/// One backward pass's view of the DAG, fixed before any backward function
/// runs.
struct Plan {
    pending: HashMap<usize, usize>,
    tapes: HashMap<usize, (Vec<Graph>, Arc<dyn GradFn>)>,
}

fn add_assign(acc: &mut [f32], delta: &[f32]) {
    for (acc, delta) in acc.iter_mut().zip(delta) {
        *acc += *delta;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::creations::scalar_graph;
    use crate::Device;

    /// A one-arc graph holding the sum of two one-arc graphs.
    fn add(lhs: &Graph, rhs: &Graph) -> Graph {
        let out = Graph::derived(&[lhs.clone(), rhs.clone()], Device::Cpu);
        out.add_node(true, false).unwrap();
        out.add_node(false, true).unwrap();
        out.add_arc_with_weight(0, 1, 0, lhs.item().unwrap() + rhs.item().unwrap())
            .unwrap();
        out.attach_backward(
            vec![lhs.clone(), rhs.clone()],
            |_: &[Graph], grad: &[f32]| vec![grad.to_vec(), grad.to_vec()],
        )
        .unwrap();
        out
    }

    #[test]
    fn diamond() {
        let a = scalar_graph(1., Device::Cpu, true);
        let b = scalar_graph(3., Device::Cpu, true);
        let c = scalar_graph(5., Device::Cpu, true);
        let ab = add(&a, &b);
        let ac = add(&a, &c);
        let abac = add(&ab, &ac);
        assert_eq!(abac.item(), Ok(10.));

        abac.backward(&[1.]).unwrap();
        assert_eq!(a.grad(), Some(vec![2.]));
        assert_eq!(b.grad(), Some(vec![1.]));
        assert_eq!(c.grad(), Some(vec![1.]));
        assert_eq!(ab.grad(), Some(vec![1.]));
        assert_eq!(abac.grad(), Some(vec![1.]));
    }

    #[test]
    fn same_input_twice() {
        let a = scalar_graph(2., Device::Cpu, true);
        let aa = add(&a, &a);
        aa.backward(&[1.5]).unwrap();
        assert_eq!(a.grad(), Some(vec![3.]));
    }

    #[test]
    fn flag_is_or_of_inputs() {
        let on = scalar_graph(0., Device::Cpu, true);
        let off = scalar_graph(0., Device::Cpu, false);
        assert!(add(&on, &off).calc_grad());
        assert!(!add(&off, &off).calc_grad());

        let out = add(&on, &off);
        out.backward(&[1.]).unwrap();
        assert_eq!(on.grad(), Some(vec![1.]));
        assert_eq!(off.grad(), None);
    }

    #[test]
    fn self_input_is_cycle() {
        let g = scalar_graph(0., Device::Cpu, true);
        assert_eq!(
            g.attach_backward(vec![g.clone()], |_: &[Graph], _: &[f32]| vec![]),
            Err(GraphError::CycleError)
        );
        assert!(g.is_leaf());
        assert!(!g.is_frozen());
    }

    #[test]
    fn attach_twice() {
        let a = scalar_graph(0., Device::Cpu, true);
        let out = add(&a, &a);
        assert_eq!(
            out.attach_backward(vec![a.clone()], |_: &[Graph], grad: &[f32]| vec![
                grad.to_vec()
            ]),
            Err(GraphError::TapeAttached)
        );
        assert_eq!(out.inputs().len(), 2);
    }

    #[test]
    fn bad_backward_output() {
        let a = scalar_graph(0., Device::Cpu, true);
        let out = Graph::derived(&[a.clone()], Device::Cpu);
        out.add_node(true, true).unwrap();
        out.add_arc(0, 0, 0).unwrap();
        out.attach_backward(vec![a.clone()], |_: &[Graph], _: &[f32]| {
            vec![vec![1., 2.]]
        })
        .unwrap();
        assert_eq!(
            out.backward(&[1.]),
            Err(GraphError::ShapeError {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn failed_backward_stores_nothing() {
        let leaf = scalar_graph(1., Device::Cpu, true);
        let mid = Graph::derived(&[leaf.clone()], Device::Cpu);
        mid.add_node(true, true).unwrap();
        mid.add_arc(0, 0, 0).unwrap();
        mid.attach_backward(vec![leaf.clone()], |_: &[Graph], _: &[f32]| {
            vec![vec![1., 2.]]
        })
        .unwrap();
        let root = add(&mid, &mid);

        let options = BackwardOptions {
            retain_graph: false,
        };
        for _ in 0..2 {
            assert_eq!(
                root.backward_with(&[1.], options),
                Err(GraphError::ShapeError {
                    expected: 1,
                    actual: 2
                })
            );
            assert_eq!(root.grad(), None);
            assert_eq!(mid.grad(), None);
            assert_eq!(leaf.grad(), None);
            assert!(!root.is_leaf());
            assert!(!mid.is_leaf());
        }
    }
}
