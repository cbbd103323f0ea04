use approx::assert_abs_diff_eq;
use graphfn_core::{Error, ExprGraph, Function, NodeKind, Opts, OptVal, Sparsity, SymVec};
use indexmap::IndexMap;

/// f(x, y) = sqrt(y) * x with x scalar (default 1), y a 2-vector.
fn build() -> Function {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let y = SymVec::sym(&g, "y", Sparsity::vector(2));
    let z = &y.sqrt() * &x;
    let mut opts = Opts::new();
    opts.insert(
        "input_scheme".to_string(),
        OptVal::StrList(vec!["x".to_string(), "y".to_string()]),
    );
    opts.insert(
        "output_scheme".to_string(),
        OptVal::StrList(vec!["z".to_string()]),
    );
    opts.insert(
        "default_in".to_string(),
        OptVal::FloatList(vec![1.0, 0.0]),
    );
    Function::new("f", &[x, y], &[z], &opts).unwrap()
}

#[test]
fn ordered_call_evaluates() {
    let f = build();
    let out = f.call(&[vec![2.0], vec![4.0, 9.0]]).unwrap();
    assert_eq!(out.len(), 1);
    assert_abs_diff_eq!(out[0][0], 4.0, epsilon = 1e-12);
    assert_abs_diff_eq!(out[0][1], 6.0, epsilon = 1e-12);
}

#[test]
fn scalar_arguments_broadcast() {
    let f = build();
    let out = f.call(&[vec![2.0], vec![9.0]]).unwrap();
    assert_eq!(out[0], vec![6.0, 6.0]);
}

#[test]
fn arity_and_shape_errors() {
    let f = build();
    assert!(matches!(
        f.call(&[vec![1.0]]).unwrap_err(),
        Error::Arity { .. }
    ));
    assert!(matches!(
        f.call(&[vec![1.0], vec![1.0, 2.0, 3.0]]).unwrap_err(),
        Error::Shape { .. }
    ));
}

#[test]
fn named_call_uses_defaults() {
    let f = build();
    let mut arg = IndexMap::new();
    arg.insert("y".to_string(), vec![4.0, 9.0]);
    let out = f.call_named(&arg).unwrap();
    // x absent, default 1.0
    assert_eq!(out["z"], vec![2.0, 3.0]);
}

#[test]
fn named_call_rejects_unknown_names() {
    let f = build();
    let mut arg = IndexMap::new();
    arg.insert("q".to_string(), vec![1.0]);
    assert!(matches!(
        f.call_named(&arg).unwrap_err(),
        Error::UnknownEntry(_)
    ));
}

#[test]
fn port_queries() {
    let f = build();
    assert_eq!(f.n_in().unwrap(), 2);
    assert_eq!(f.n_out().unwrap(), 1);
    assert_eq!(f.name(), "f");
    assert_eq!(f.kind().unwrap(), NodeKind::Primitive);
    assert_eq!(f.name_in(1).unwrap(), "y");
    assert_eq!(f.index_in("y").unwrap(), 1);
    assert_eq!(f.index_out("z").unwrap(), 0);
    assert_eq!(f.nnz_in(1).unwrap(), f.sparsity_in(1).unwrap().nnz());
    assert_eq!(f.nnz_in(1).unwrap(), 2);
    assert_eq!(f.numel_in(1).unwrap(), 2);
    assert_eq!(f.nnz_out_total().unwrap(), 2);
    assert_eq!(f.size_in(1).unwrap(), (2, 1));
    assert_eq!(f.default_in(0).unwrap(), 1.0);
    let work = f.work_sizes().unwrap();
    assert_eq!(work.sz_arg, 2);
    assert_eq!(work.sz_res, 1);
    assert!(work.sz_w > 0);
    assert!(matches!(f.index_in("nope"), Err(Error::UnknownEntry(_))));
    assert!(matches!(f.nnz_in(7), Err(Error::Index { .. })));
}

#[test]
fn display_shows_signature() {
    let f = build();
    assert_eq!(format!("{f}"), "f:(x,y[2])->(z[2])");
}

#[test]
fn null_handle_behavior() {
    let f = Function::null();
    assert!(f.is_null());
    assert_eq!(f.name(), "null");
    assert!(matches!(f.n_in(), Err(Error::NullHandle)));
    assert!(matches!(f.call(&[]), Err(Error::NullHandle)));
}

#[test]
fn inline_hints_are_mutually_exclusive() {
    let f = build();
    assert!(f
        .call_ext(&[vec![1.0], vec![1.0, 1.0]], true, true)
        .is_err());
}

#[test]
fn invalid_name_is_rejected_at_construction() {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let y = x.sqrt();
    let err = Function::new("1bad", &[x], &[y], &Opts::new()).unwrap_err();
    assert!(matches!(err, Error::InvalidName(_)));
}

#[test]
fn from_map_resolves_entries_by_name() {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let z = &x * &x;
    let mut entries = IndexMap::new();
    entries.insert("x".to_string(), x);
    entries.insert("z".to_string(), z);
    let argn = vec!["x".to_string(), "y".to_string()];
    let resn = vec!["z".to_string()];
    let f = Function::from_map("fm", &entries, &argn, &resn, &Opts::new()).unwrap();
    assert_eq!(f.n_in().unwrap(), 2);
    assert_eq!(f.nnz_in(1).unwrap(), 0);
    let out = f.call(&[vec![3.0], vec![]]).unwrap();
    assert_eq!(out[0], vec![9.0]);
}

#[test]
fn from_map_rejects_unknown_entries() {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let mut entries = IndexMap::new();
    entries.insert("bogus".to_string(), x);
    let argn = vec!["x".to_string()];
    let resn = vec!["z".to_string()];
    let err = Function::from_map("fm", &entries, &argn, &resn, &Opts::new()).unwrap_err();
    assert!(matches!(err, Error::UnknownEntry(_)));
}
