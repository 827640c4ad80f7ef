use gradgraph::{linear_graph, scalar_graph, Device, GraphError, EPSILON};
use rstest::rstest;

#[rstest]
#[case(0., false)]
#[case(1.25, true)]
#[case(-7.5, false)]
#[case(12345., true)]
fn scalar(#[case] weight: f32, #[case] calc_grad: bool) {
    let g = scalar_graph(weight, Device::Cpu, calc_grad);
    assert_eq!(g.num_arcs(), 1);
    assert_eq!(g.label(0), Ok(EPSILON));
    assert_eq!(g.num_nodes(), 2);
    assert_eq!(g.weight(0), Ok(weight));
    assert_eq!(g.item(), Ok(weight));
    assert_eq!(g.calc_grad(), calc_grad);
    assert_eq!(g.is_start(0), Ok(true));
    assert_eq!(g.is_accept(1), Ok(true));
    assert_eq!(g.is_accept(0), Ok(false));
    assert_eq!(g.device(), Device::Cpu);
    assert!(g.is_leaf());
}

#[rstest]
#[case(1, 1)]
#[case(5, 10)]
#[case(3, 2)]
#[case(7, 1)]
fn linear(#[case] m: usize, #[case] n: usize) {
    let arr: Vec<f32> = (0..m * n).map(|i| (i as f32 * 0.37).sin()).collect();
    let g = linear_graph(m, n, Device::Cpu, false);
    assert!(g.weights().iter().all(|w| *w == 0.));
    g.set_weights(&arr).unwrap();

    assert_eq!(g.num_nodes(), m + 1);
    assert_eq!(g.num_arcs(), m * n);
    for i in 0..m {
        for j in 0..n {
            let idx = i * n + j;
            assert_eq!(g.label(idx), Ok(j as i32));
            assert_eq!(g.weight(idx), Ok(arr[idx]));
            assert_eq!(g.src_node(idx), Ok(i));
            assert_eq!(g.dst_node(idx), Ok(i + 1));
        }
    }
    assert_eq!(g.num_start(), 1);
    assert_eq!(g.num_accept(), 1);
    assert_eq!(g.is_accept(m), Ok(true));
    assert_eq!(g.is_start(0), Ok(true));
    assert_eq!(&*g.weights(), arr.as_slice());
}

#[test]
fn linear_set_weights_mismatch() {
    let g = linear_graph(2, 3, Device::Cpu, true);
    let arr = [1., 2., 3., 4., 5., 6.];
    g.set_weights(&arr).unwrap();
    assert_eq!(
        g.set_weights(&[0.; 5]),
        Err(GraphError::DimensionMismatch {
            expected: 6,
            actual: 5
        })
    );
    assert_eq!(&*g.weights(), &arr);
}

#[test]
fn linear_item_is_shape_error() {
    let g = linear_graph(2, 2, Device::Cpu, false);
    assert_eq!(
        g.item(),
        Err(GraphError::ShapeError {
            expected: 1,
            actual: 4
        })
    );
    assert_eq!(linear_graph(1, 1, Device::Cpu, false).item(), Ok(0.));
}

#[test]
fn set_weights_idempotent() {
    let g = linear_graph(4, 3, Device::Cpu, false);
    let arr: Vec<f32> = (0..12).map(|i| i as f32 - 5.5).collect();
    g.set_weights(&arr).unwrap();
    let before = g.to_string();
    g.set_weights(&g.weights()).unwrap();
    assert_eq!(g.to_string(), before);
    assert_eq!(&*g.weights(), arr.as_slice());
}
