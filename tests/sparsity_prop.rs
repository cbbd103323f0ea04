use graphfn_core::{Error, ExprGraph, Function, MapStrategy, Opts, Sparsity, SymVec};
use rand::Rng;

/// o0 = x0 + y, o1 = x1 * x1 with x a 2-vector and y scalar.
fn build() -> Function {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::vector(2));
    let y = SymVec::sym(&g, "y", Sparsity::scalar());
    let xe = x.elems().to_vec();
    let ye = y.elems().to_vec();
    let o0 = SymVec::from_elems(&g, Sparsity::scalar(), vec![&xe[0] + &ye[0]]).unwrap();
    let o1 = SymVec::from_elems(&g, Sparsity::scalar(), vec![&xe[1] * &xe[1]]).unwrap();
    Function::new("f", &[x, y], &[o0, o1], &Opts::new()).unwrap()
}

#[test]
fn forward_propagation_unions_dependencies() {
    let f = build();
    assert!(f.has_spfwd().unwrap());
    let out = f.sp_forward(&[vec![1, 2], vec![4]]).unwrap();
    assert_eq!(out[0], vec![1 | 4]);
    assert_eq!(out[1], vec![2]);
}

#[test]
fn reverse_propagation_accumulates_into_inputs() {
    let f = build();
    assert!(f.has_sprev().unwrap());
    let acc = f.sp_reverse(&[vec![1], vec![2]]).unwrap();
    assert_eq!(acc[0], vec![1, 2]);
    assert_eq!(acc[1], vec![1]);
}

#[test]
fn forward_and_reverse_are_consistent() {
    let f = build();
    // Tag every input element with its own bit and propagate forward
    let fwd = f.sp_forward(&[vec![1 << 0, 1 << 1], vec![1 << 2]]).unwrap();
    let n_out_elems = 2;
    for o in 0..n_out_elems {
        // Reverse from this single output element
        let mut seeds = vec![vec![0u64; 1], vec![0u64; 1]];
        seeds[o][0] = 1;
        let rev = f.sp_reverse(&seeds).unwrap();
        let rev_flat: Vec<u64> = rev.iter().flatten().copied().collect();
        let fwd_bits = fwd[o][0];
        for (e, &r) in rev_flat.iter().enumerate() {
            let reachable_forward = fwd_bits & (1 << e) != 0;
            let reachable_backward = r != 0;
            assert_eq!(reachable_forward, reachable_backward);
        }
    }
}

#[test]
fn random_seed_words_propagate_by_or() {
    let f = build();
    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        let sx: Vec<u64> = (0..2).map(|_| rng.gen()).collect();
        let sy: Vec<u64> = vec![rng.gen()];
        let out = f.sp_forward(&[sx.clone(), sy.clone()]).unwrap();
        assert_eq!(out[0][0], sx[0] | sy[0]);
        assert_eq!(out[1][0], sx[1]);
    }
}

#[test]
fn seed_arity_and_shape_are_checked() {
    let f = build();
    assert!(matches!(
        f.sp_forward(&[vec![1, 2]]).unwrap_err(),
        Error::Arity { .. }
    ));
    assert!(matches!(
        f.sp_forward(&[vec![1], vec![4]]).unwrap_err(),
        Error::Shape { .. }
    ));
}

#[test]
fn mapped_functions_propagate_per_iteration() {
    let f = build();
    let fm = f.map(2, MapStrategy::Serial).unwrap();
    let out = fm
        .sp_forward(&[vec![1, 2, 8, 16], vec![4, 32]])
        .unwrap();
    assert_eq!(out[0], vec![1 | 4, 8 | 32]);
    assert_eq!(out[1], vec![2, 16]);
}

#[test]
fn switch_reports_propagation_as_unsupported() {
    let g = ExprGraph::new();
    let x = SymVec::sym(&g, "x", Sparsity::scalar());
    let o = x.sqrt();
    let f0 = Function::new("f0", &[x], &[o], &Opts::new()).unwrap();
    let g2 = ExprGraph::new();
    let x2 = SymVec::sym(&g2, "x", Sparsity::scalar());
    let o2 = x2.exp();
    let f1 = Function::new("f1", &[x2], &[o2], &Opts::new()).unwrap();
    let sw = Function::conditional("sw", &[f0], &f1).unwrap();
    assert!(!sw.has_spfwd().unwrap());
    assert!(!sw.has_sprev().unwrap());
    assert!(matches!(
        sw.sp_forward(&[vec![1], vec![1]]).unwrap_err(),
        Error::Capability(_)
    ));
    assert!(matches!(
        sw.sp_reverse(&[vec![1]]).unwrap_err(),
        Error::Capability(_)
    ));
}
