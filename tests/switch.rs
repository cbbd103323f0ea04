use approx::assert_abs_diff_eq;
use graphfn_core::{Error, ExprGraph, Function, NodeKind, Opts, OptVal, Sparsity, SymVec};

fn scalar_fn(name: &str, f: impl Fn(&SymVec) -> SymVec) -> Function {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let o = f(&x);
    let mut opts = Opts::new();
    opts.insert(
        "input_scheme".to_string(),
        OptVal::StrList(vec!["x".to_string()]),
    );
    opts.insert(
        "output_scheme".to_string(),
        OptVal::StrList(vec!["o".to_string()]),
    );
    Function::new(name, &[x], &[o], &opts).unwrap()
}

fn build_switch() -> Function {
    let f0 = scalar_fn("f0", |x| {
        let c = SymVec::constant(x.graph(), Sparsity::scalar(), 1.0);
        x + &c
    });
    let f1 = scalar_fn("f1", |x| x * x);
    let fd = scalar_fn("fd", |x| -x);
    Function::conditional("sw", &[f0, f1], &fd).unwrap()
}

#[test]
fn selector_picks_the_candidate() {
    let sw = build_switch();
    assert_eq!(sw.kind().unwrap(), NodeKind::Switch);
    assert_eq!(sw.n_in().unwrap(), 2);
    assert_eq!(sw.name_in(0).unwrap(), "ind");
    let out = sw.call(&[vec![0.0], vec![5.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 6.0, epsilon = 1e-12);
    let out = sw.call(&[vec![1.0], vec![5.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 25.0, epsilon = 1e-12);
}

#[test]
fn out_of_range_selectors_use_the_default() {
    let sw = build_switch();
    for sel in [5.0, -1.0, f64::NAN, 2.0] {
        let out = sw.call(&[vec![sel], vec![5.0]]).unwrap();
        assert_abs_diff_eq!(out[0][0], -5.0, epsilon = 1e-12);
    }
}

#[test]
fn mismatched_signatures_fail_at_construction() {
    let f0 = scalar_fn("f0", |x| x.sqrt());
    // a candidate with a 2-vector input cannot join a scalar switch
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::vector(2));
    let o = x.exp();
    let wide_in = Function::new("w", &[x], &[o], &Opts::new()).unwrap();
    assert!(matches!(
        Function::conditional("sw", &[wide_in], &f0).unwrap_err(),
        Error::Shape { .. }
    ));

    // a candidate with an extra output as well
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let o1 = x.exp();
    let o2 = x.sin();
    let two_out = Function::new("t", &[x], &[o1, o2], &Opts::new()).unwrap();
    assert!(matches!(
        Function::conditional("sw", &[two_out], &f0).unwrap_err(),
        Error::Shape { .. }
    ));
}

#[test]
fn if_else_selects_branches() {
    let ft = scalar_fn("ft", |x| x * x);
    let ff = scalar_fn("ff", |x| -x);
    let ie = Function::if_else("ie", &ft, &ff).unwrap();
    let out = ie.call(&[vec![0.0], vec![3.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], -3.0, epsilon = 1e-12);
    let out = ie.call(&[vec![1.0], vec![3.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 9.0, epsilon = 1e-12);
    // out of range also takes the true branch (the default)
    let out = ie.call(&[vec![7.0], vec![3.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 9.0, epsilon = 1e-12);
}

#[test]
fn switch_differentiates_branch_wise() {
    let sw = build_switch();
    let dsw = sw.forward(1).unwrap();
    // inputs: ind, x, fwd_x; outputs: o, fwd_o
    let out = dsw.call(&[vec![1.0], vec![5.0], vec![1.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 25.0, epsilon = 1e-12);
    assert_abs_diff_eq!(out[1][0], 10.0, epsilon = 1e-12);
    let out = dsw.call(&[vec![9.0], vec![5.0], vec![1.0]]).unwrap();
    assert_abs_diff_eq!(out[1][0], -1.0, epsilon = 1e-12);
}

#[test]
fn missing_selector_defaults_to_candidate_zero() {
    let sw = build_switch();
    let mut arg = indexmap::IndexMap::new();
    arg.insert("x".to_string(), vec![5.0]);
    let out = sw.call_named(&arg).unwrap();
    assert_abs_diff_eq!(out["o"][0], 6.0, epsilon = 1e-12);
}
