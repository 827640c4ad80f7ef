use crate::{device::Device, graph::EPSILON, Graph};

/// Largest `n` accepted by [`linear_graph`]: labels run up to `i32::MAX`.
const MAX_SYMBOLS: usize = i32::MAX as usize + 1;

/// A two-node graph with a single epsilon arc of weight `weight`.
pub fn scalar_graph(weight: f32, device: Device, calc_grad: bool) -> Graph {
    let g = Graph::with_device(device, calc_grad);
    g.push_node(true, false);
    g.push_node(false, true);
    g.push_arc(0, 1, EPSILON, weight);
    g
}

/// A chain of `m + 1` nodes where every consecutive pair is joined by `n`
/// arcs labelled `0..n`.
///
/// Arc `i * n + j` leaves node `i` with label `j`, so a row-major `m x n`
/// score matrix can be loaded with [`Graph::set_weights`]. All weights start
/// at zero.
///
/// # Panics
///
/// Panics if `n` exceeds the label range, i.e. `n - 1 > i32::MAX`.
pub fn linear_graph(m: usize, n: usize, device: Device, calc_grad: bool) -> Graph {
    assert!(
        n <= MAX_SYMBOLS,
        "linear_graph: {n} symbols do not fit in i32 labels"
    );
    let g = Graph::with_device(device, calc_grad);
    g.push_node(true, m == 0);
    for i in 1..=m {
        g.push_node(false, i == m);
        for j in 0..n {
            g.push_arc(i - 1, i, j as i32, 0.);
        }
    }
    g
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_linear() {
        let g = linear_graph(0, 3, Device::Cpu, false);
        assert_eq!(g.num_nodes(), 1);
        assert_eq!(g.num_arcs(), 0);
        assert_eq!(g.is_start(0), Ok(true));
        assert_eq!(g.is_accept(0), Ok(true));
    }

    #[test]
    fn device_is_kept() {
        let g = scalar_graph(1., Device::Cuda(2), true);
        assert_eq!(g.device(), Device::Cuda(2));
        assert!(g.is_leaf());
    }

    #[test]
    #[should_panic(expected = "do not fit in i32 labels")]
    fn too_many_symbols() {
        linear_graph(0, MAX_SYMBOLS + 1, Device::Cpu, false);
    }

    #[test]
    fn largest_label() {
        let g = linear_graph(0, MAX_SYMBOLS, Device::Cpu, false);
        assert_eq!(g.num_arcs(), 0);
    }
}
