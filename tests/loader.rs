use std::io::Write;

use approx::assert_abs_diff_eq;
use graphfn_core::{Error, Function, NodeKind};

fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!("graphfn_{}_{}.txt", name, std::process::id()));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    path
}

#[test]
fn loads_an_interpolant_description() {
    let path = write_temp(
        "ramp",
        "# piecewise-linear ramp\n\
         CLASS interpolant\n\
         NAME ramp\n\
         # grid has three points\n\
         GRID 3 0 1 2\n\
         VALUES 3 0 2 4\n",
    );
    let f = Function::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(f.name(), "ramp");
    assert_eq!(f.kind().unwrap(), NodeKind::Spline);
    assert_eq!(f.n_in().unwrap(), 1);
    let out = f.call(&[vec![1.5]]).unwrap();
    assert_abs_diff_eq!(out[0][0], 3.0, epsilon = 1e-12);
    // clamped extrapolation
    let out = f.call(&[vec![-4.0]]).unwrap();
    assert_abs_diff_eq!(out[0][0], -8.0, epsilon = 1e-12);
}

#[test]
fn name_directive_is_optional() {
    let path = write_temp(
        "anon",
        "CLASS interpolant\nGRID 2 0 1\nVALUES 2 0 1\n",
    );
    let f = Function::load(&path).unwrap();
    std::fs::remove_file(&path).ok();
    assert_eq!(f.name(), "interpolant");
}

#[test]
fn unknown_class_is_rejected() {
    let path = write_temp("unknown", "CLASS frobnicator\n");
    let err = Function::load(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, Error::UnsupportedType(t) if t == "frobnicator"));
}

#[test]
fn missing_file_is_an_io_error() {
    let err = Function::load("/nonexistent/graphfn.txt").unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn malformed_grid_is_rejected() {
    let path = write_temp("bad", "CLASS interpolant\nGRID 3 0 1\n");
    let err = Function::load(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, Error::Msg(_)));
}

#[test]
fn interpolant_constructor_validates_the_grid() {
    assert!(Function::interpolant("s", &[0.0], &[1.0]).is_err());
    assert!(Function::interpolant("s", &[0.0, 1.0], &[1.0]).is_err());
    assert!(Function::interpolant("s", &[1.0, 0.0], &[1.0, 2.0]).is_err());
}
