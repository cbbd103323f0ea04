use approx::assert_abs_diff_eq;
use graphfn_core::{Error, ExprGraph, Function, MapStrategy, Opts, OptVal, Sparsity, SymVec};
use rand::Rng;

/// f(x, y) = x*y + sin(x), all scalars, output named z.
fn scalar_fn() -> Function {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let y = SymVec::sym(&g, "y", Sparsity::scalar());
    let z = &(&x * &y) + &x.sin();
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
fn forward_mode_single_direction() {
    let f = scalar_fn();
    let df = f.forward(1).unwrap();
    assert_eq!(df.n_in().unwrap(), 4);
    assert_eq!(df.n_out().unwrap(), 2);
    assert_eq!(df.name_in(2).unwrap(), "fwd_x");
    assert_eq!(df.name_out(1).unwrap(), "fwd_z");
    let out = df
        .call(&[vec![2.0], vec![3.0], vec![1.0], vec![0.0]])
        .unwrap();
    assert_abs_diff_eq!(out[0][0], 6.0 + 2.0_f64.sin(), epsilon = 1e-12);
    assert_abs_diff_eq!(out[1][0], 3.0 + 2.0_f64.cos(), epsilon = 1e-12);
}

#[test]
fn forward_mode_two_directions() {
    let f = scalar_fn();
    let df = f.forward(2).unwrap();
    // seed ports carry one column block per direction
    assert_eq!(df.nnz_in(2).unwrap(), 2);
    let out = df
        .call(&[vec![2.0], vec![3.0], vec![1.0, 0.0], vec![0.0, 1.0]])
        .unwrap();
    assert_abs_diff_eq!(out[1][0], 3.0 + 2.0_f64.cos(), epsilon = 1e-12);
    assert_abs_diff_eq!(out[1][1], 2.0, epsilon = 1e-12);
}

#[test]
fn reverse_mode_single_direction() {
    let f = scalar_fn();
    let df = f.reverse(1).unwrap();
    assert_eq!(df.n_in().unwrap(), 3);
    assert_eq!(df.n_out().unwrap(), 3);
    assert_eq!(df.name_in(2).unwrap(), "adj_z");
    assert_eq!(df.name_out(1).unwrap(), "adj_x");
    let out = df.call(&[vec![2.0], vec![3.0], vec![1.0]]).unwrap();
    assert_abs_diff_eq!(out[1][0], 3.0 + 2.0_f64.cos(), epsilon = 1e-12);
    assert_abs_diff_eq!(out[2][0], 2.0, epsilon = 1e-12);
}

#[test]
fn zero_directions_is_an_error() {
    let f = scalar_fn();
    assert!(f.forward(0).is_err());
    assert!(f.reverse(0).is_err());
}

#[test]
fn forward_and_reverse_agree_on_dot_products() {
    let f = scalar_fn();
    let fwd = f.forward(1).unwrap();
    let rev = f.reverse(1).unwrap();
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let x: f64 = rng.gen_range(-2.0..2.0);
        let y: f64 = rng.gen_range(-2.0..2.0);
        let dx: f64 = rng.gen_range(-1.0..1.0);
        let dy: f64 = rng.gen_range(-1.0..1.0);
        let az: f64 = rng.gen_range(-1.0..1.0);
        let fo = fwd.call(&[vec![x], vec![y], vec![dx], vec![dy]]).unwrap();
        let ro = rev.call(&[vec![x], vec![y], vec![az]]).unwrap();
        // <adjoint seed, J dx> == <J^T adjoint seed, dx>
        let lhs = az * fo[1][0];
        let rhs = ro[1][0] * dx + ro[2][0] * dy;
        assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-10);
    }
}

#[test]
fn jacobian_is_one_combined_matrix() {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::vector(2));
    let xe = x.elems().to_vec();
    let o0 = SymVec::from_elems(&g, Sparsity::scalar(), vec![&xe[0] * &xe[1]]).unwrap();
    let o1 = SymVec::from_elems(&g, Sparsity::scalar(), vec![&xe[0] + &xe[1]]).unwrap();
    let f = Function::new("f", &[x], &[o0, o1], &Opts::new()).unwrap();
    let jf = f.jacobian().unwrap();
    assert_eq!(jf.n_out().unwrap(), 1);
    assert_eq!(jf.name_out(0).unwrap(), "jac");
    assert_eq!(jf.size_out(0).unwrap(), (2, 2));
    let out = jf.call(&[vec![3.0, 5.0]]).unwrap();
    // column-major: d/dx0 then d/dx1
    assert_eq!(out[0], vec![5.0, 1.0, 3.0, 1.0]);
}

#[test]
fn factory_builds_requested_derivatives() {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let y = SymVec::sym(&g, "y", Sparsity::scalar());
    let z = &(&x * &x) * &y;
    let mut opts = Opts::new();
    opts.insert(
        "input_scheme".to_string(),
        OptVal::StrList(vec!["x".to_string(), "y".to_string()]),
    );
    opts.insert(
        "output_scheme".to_string(),
        OptVal::StrList(vec!["z".to_string()]),
    );
    let f = Function::new("f", &[x, y], &[z], &opts).unwrap();

    let d = f
        .factory("d_f", &["jac:z:x", "grad:z:x", "sym:hess:z:x:x", "z"])
        .unwrap();
    assert_eq!(d.n_out().unwrap(), 4);
    assert_eq!(d.name_out(0).unwrap(), "jac_z_x");
    assert_eq!(d.name_out(2).unwrap(), "sym_hess_z_x_x");
    let out = d.call(&[vec![2.0], vec![3.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 12.0, epsilon = 1e-12); // 2xy
    assert_abs_diff_eq!(out[1][0], 12.0, epsilon = 1e-12);
    assert_abs_diff_eq!(out[2][0], 6.0, epsilon = 1e-12); // 2y
    assert_abs_diff_eq!(out[3][0], 12.0, epsilon = 1e-12); // x*x*y
}

#[test]
fn factory_rejects_bad_specs() {
    let f = scalar_fn();
    assert!(matches!(
        f.factory("d", &["foo:z:x"]).unwrap_err(),
        Error::UnknownSpec(_)
    ));
    assert!(matches!(
        f.factory("d", &["jac:q:x"]).unwrap_err(),
        Error::UnknownSpec(_)
    ));
    assert!(matches!(
        f.factory("d", &["jac:z:q"]).unwrap_err(),
        Error::UnknownSpec(_)
    ));
    assert!(matches!(
        f.factory("d", &["notanoutput"]).unwrap_err(),
        Error::UnknownSpec(_)
    ));
}

#[test]
fn mapped_functions_differentiate_through_expansion() {
    let f = scalar_fn();
    let fm = f.map(2, MapStrategy::Serial).unwrap();
    let dfm = fm.forward(1).unwrap();
    let out = dfm
        .call(&[
            vec![2.0, 5.0],
            vec![3.0, 7.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ])
        .unwrap();
    assert_abs_diff_eq!(out[1][0], 3.0 + 2.0_f64.cos(), epsilon = 1e-12);
    assert_abs_diff_eq!(out[1][1], 7.0 + 5.0_f64.cos(), epsilon = 1e-12);
}

#[test]
fn spline_derivatives_use_segment_slopes() {
    let s = Function::interpolant("s", &[0.0, 1.0, 2.0], &[0.0, 2.0, 1.0]).unwrap();
    let ds = s.forward(1).unwrap();
    let out = ds.call(&[vec![0.5], vec![1.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(out[1][0], 2.0, epsilon = 1e-12);
    let out = ds.call(&[vec![1.5], vec![1.0]]).unwrap();
    assert_abs_diff_eq!(out[1][0], -1.0, epsilon = 1e-12);

    let rs = s.reverse(1).unwrap();
    let out = rs.call(&[vec![0.5], vec![3.0]]).unwrap();
    assert_abs_diff_eq!(out[1][0], 6.0, epsilon = 1e-12);
}
