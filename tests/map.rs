use approx::assert_abs_diff_eq;
use graphfn_core::{Error, ExprGraph, Function, MapStrategy, Opts, OptVal, Sparsity, SymVec};
use rand::Rng;

/// f(x, y) = x*y + 1, scalars, ports named x/y/z.
fn build() -> Function {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let y = SymVec::sym(&g, "y", Sparsity::scalar());
    let one = SymVec::constant(&g, Sparsity::scalar(), 1.0);
    let z = &(&x * &y) + &one;
    let mut opts = Opts::new();
    opts.insert(
        "input_scheme".to_string(),
        OptVal::StrList(vec!["x".to_string(), "y".to_string()]),
    );
    opts.insert(
        "output_scheme".to_string(),
        OptVal::StrList(vec!["z".to_string()]),
    );
    Function::new("f", &[x, y], &[z], &opts).unwrap()
}

#[test]
fn map_of_one_is_the_identity() {
    let f = build();
    for strategy in [
        MapStrategy::Unrolled,
        MapStrategy::Serial,
        MapStrategy::Threaded,
    ] {
        let m = f.map(1, strategy).unwrap();
        assert!(m.is_same(&f));
    }
}

#[test]
fn map_of_zero_is_an_error() {
    let f = build();
    assert!(f.map(0, MapStrategy::Serial).is_err());
}

#[test]
fn all_strategies_agree() {
    let f = build();
    let n = 5;
    let mut rng = rand::thread_rng();
    let xs: Vec<f64> = (0..n).map(|_| rng.gen_range(-3.0..3.0)).collect();
    let ys: Vec<f64> = (0..n).map(|_| rng.gen_range(-3.0..3.0)).collect();
    let expected: Vec<f64> = xs.iter().zip(&ys).map(|(x, y)| x * y + 1.0).collect();

    for strategy in [
        MapStrategy::Unrolled,
        MapStrategy::Serial,
        MapStrategy::Threaded,
    ] {
        let m = f.map(n, strategy).unwrap();
        assert_eq!(m.nnz_in(0).unwrap(), n);
        let out = m.call(&[xs.clone(), ys.clone()]).unwrap();
        for (got, want) in out[0].iter().zip(&expected) {
            assert_abs_diff_eq!(got, want, epsilon = 1e-12);
        }
    }
}

#[test]
fn reduced_inputs_broadcast_and_reduced_outputs_sum() {
    let f = build();
    let xs = vec![1.0, 2.0, 3.0];
    let y = vec![4.0];
    let expected: f64 = xs.iter().map(|x| x * 4.0 + 1.0).sum();

    for strategy in [
        MapStrategy::Unrolled,
        MapStrategy::Serial,
        MapStrategy::Threaded,
    ] {
        let m = f.map_reduced(3, strategy, &[1], &[0]).unwrap();
        // shared input keeps its width, summed output keeps its width
        assert_eq!(m.nnz_in(1).unwrap(), 1);
        assert_eq!(m.nnz_out(0).unwrap(), 1);
        let out = m.call(&[xs.clone(), y.clone()]).unwrap();
        assert_abs_diff_eq!(out[0][0], expected, epsilon = 1e-12);
    }
}

#[test]
fn reduced_ports_resolve_by_name() {
    let f = build();
    let m = f
        .map_reduced_named(3, MapStrategy::Serial, &["y"], &["z"])
        .unwrap();
    let out = m.call(&[vec![1.0, 2.0, 3.0], vec![4.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 27.0, epsilon = 1e-12);

    assert!(matches!(
        f.map_reduced_named(3, MapStrategy::Serial, &["nope"], &[])
            .unwrap_err(),
        Error::UnknownSpec(_)
    ));
}

#[test]
fn reduce_indices_are_bounds_checked() {
    let f = build();
    assert!(matches!(
        f.map_reduced(3, MapStrategy::Serial, &[7], &[]).unwrap_err(),
        Error::Index { .. }
    ));
}

#[test]
fn nested_maps_compose() {
    let f = build();
    let m = f
        .map(2, MapStrategy::Serial)
        .unwrap()
        .map(3, MapStrategy::Threaded)
        .unwrap();
    assert_eq!(m.nnz_in(0).unwrap(), 6);
    let xs: Vec<f64> = (0..6).map(|i| i as f64).collect();
    let ys: Vec<f64> = (0..6).map(|i| (i + 1) as f64).collect();
    let out = m.call(&[xs.clone(), ys.clone()]).unwrap();
    for i in 0..6 {
        assert_abs_diff_eq!(out[0][i], xs[i] * ys[i] + 1.0, epsilon = 1e-12);
    }
}

#[test]
fn named_call_works_on_map_nodes() {
    let f = build();
    let m = f.map(2, MapStrategy::Serial).unwrap();
    let mut arg = indexmap::IndexMap::new();
    arg.insert("x".to_string(), vec![2.0, 3.0]);
    arg.insert("y".to_string(), vec![5.0, 7.0]);
    let out = m.call_named(&arg).unwrap();
    assert_eq!(out["z"], vec![11.0, 22.0]);
}
