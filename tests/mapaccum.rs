use approx::assert_abs_diff_eq;
use graphfn_core::{Error, ExprGraph, Function, Opts, OptVal, Sparsity, SymVec};

/// f(s, u) = [s*0.5 + u, s*u]: one accumulator plus a regular output.
fn build() -> Function {
    let g = ExprGraph::new();
    let s = SymVec::sym(&g, "s", Sparsity::scalar());
    let u = SymVec::sym(&g, "u", Sparsity::scalar());
    let half = SymVec::constant(&g, Sparsity::scalar(), 0.5);
    let snew = &(&s * &half) + &u;
    let y = &s * &u;
    let mut opts = Opts::new();
    opts.insert(
        "input_scheme".to_string(),
        OptVal::StrList(vec!["s".to_string(), "u".to_string()]),
    );
    opts.insert(
        "output_scheme".to_string(),
        OptVal::StrList(vec!["snew".to_string(), "y".to_string()]),
    );
    Function::new("f", &[s, u], &[snew, y], &opts).unwrap()
}

fn reference(s0: f64, us: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut s = s0;
    let mut traj = Vec::new();
    let mut ys = Vec::new();
    for &u in us {
        let snew = s * 0.5 + u;
        traj.push(snew);
        ys.push(s * u);
        s = snew;
    }
    (traj, ys)
}

#[test]
fn single_iteration_returns_the_original() {
    let f = build();
    let m = f.mapaccum("ma", 1, 1, &Opts::new()).unwrap();
    assert!(m.is_same(&f));
}

#[test]
fn accumulator_threads_state_between_iterations() {
    let f = build();
    let n = 4;
    let m = f.mapaccum("ma", n, 1, &Opts::new()).unwrap();
    assert_eq!(m.nnz_in(0).unwrap(), 1);
    assert_eq!(m.nnz_in(1).unwrap(), n);
    assert_eq!(m.nnz_out(0).unwrap(), n);

    let s0 = 1.0;
    let us = vec![2.0, -1.0, 0.5, 3.0];
    let (traj, ys) = reference(s0, &us);
    let out = m.call(&[vec![s0], us.clone()]).unwrap();
    for i in 0..n {
        assert_abs_diff_eq!(out[0][i], traj[i], epsilon = 1e-12);
        assert_abs_diff_eq!(out[1][i], ys[i], epsilon = 1e-12);
    }
}

#[test]
fn too_many_accumulators_is_an_error() {
    let f = build();
    assert!(f.mapaccum("ma", 3, 3, &Opts::new()).is_err());
    assert!(f.mapaccum("ma", 0, 1, &Opts::new()).is_err());
}

#[test]
fn selected_accumulators_match_manual() {
    // Same recurrence, but with the accumulator in the second position on
    // both sides: f(u, s) = [y, snew]
    let g = ExprGraph::new();
    let u = SymVec::sym(&g, "u", Sparsity::scalar());
    let s = SymVec::sym(&g, "s", Sparsity::scalar());
    let half = SymVec::constant(&g, Sparsity::scalar(), 0.5);
    let y = &s * &u;
    let snew = &(&s * &half) + &u;
    let mut opts = Opts::new();
    opts.insert(
        "input_scheme".to_string(),
        OptVal::StrList(vec!["u".to_string(), "s".to_string()]),
    );
    opts.insert(
        "output_scheme".to_string(),
        OptVal::StrList(vec!["y".to_string(), "snew".to_string()]),
    );
    let f = Function::new("f", &[u, s], &[y, snew], &opts).unwrap();

    let n = 4;
    let m = f.mapaccum_sel("ma", n, &[1], &[1], &Opts::new()).unwrap();
    // original port order is restored
    assert_eq!(m.nnz_in(0).unwrap(), n);
    assert_eq!(m.nnz_in(1).unwrap(), 1);
    assert_eq!(m.nnz_out(0).unwrap(), n);
    assert_eq!(m.nnz_out(1).unwrap(), n);

    let s0 = 1.0;
    let us = vec![2.0, -1.0, 0.5, 3.0];
    let (traj, ys) = reference(s0, &us);
    let out = m.call(&[us.clone(), vec![s0]]).unwrap();
    for i in 0..n {
        assert_abs_diff_eq!(out[0][i], ys[i], epsilon = 1e-12);
        assert_abs_diff_eq!(out[1][i], traj[i], epsilon = 1e-12);
    }
}

#[test]
fn named_accumulators_resolve_via_the_port_table() {
    let f = build();
    let m = f
        .mapaccum_named("ma", 3, &["s"], &["snew"], &Opts::new())
        .unwrap();
    let out = m.call(&[vec![1.0], vec![2.0, -1.0, 0.5]]).unwrap();
    let (traj, _) = reference(1.0, &[2.0, -1.0, 0.5]);
    for i in 0..3 {
        assert_abs_diff_eq!(out[0][i], traj[i], epsilon = 1e-12);
    }
}

#[test]
fn index_set_violations_are_arity_errors() {
    let f = build();
    assert!(matches!(
        f.mapaccum_sel("ma", 3, &[0, 0], &[0, 1], &Opts::new())
            .unwrap_err(),
        Error::Arity { .. }
    ));
    assert!(matches!(
        f.mapaccum_sel("ma", 3, &[5], &[0], &Opts::new()).unwrap_err(),
        Error::Arity { .. }
    ));
    assert!(matches!(
        f.mapaccum_sel("ma", 3, &[0], &[], &Opts::new()).unwrap_err(),
        Error::Arity { .. }
    ));
}

#[test]
fn wide_accumulator_output_carries_its_trailing_slice() {
    // g(s) = [s, s+1] stacked horizontally; only the last column threads
    let g = ExprGraph::new();
    let s = SymVec::sym(&g, "s", Sparsity::scalar());
    let one = SymVec::constant(&g, Sparsity::scalar(), 1.0);
    let wide = SymVec::horzcat(&[s.clone(), &s + &one]).unwrap();
    let f = Function::new("g", &[s], &[wide], &Opts::new()).unwrap();

    let m = f.mapaccum("ma", 3, 1, &Opts::new()).unwrap();
    assert_eq!(m.nnz_out(0).unwrap(), 6);
    let out = m.call(&[vec![0.0]]).unwrap();
    assert_eq!(out[0], vec![0.0, 1.0, 1.0, 2.0, 2.0, 3.0]);
}
