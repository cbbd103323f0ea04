use crate::node::{OptVal, Opts};
use crate::{bail, Function, Result};

/// Text-emission backend: collects the lowered bodies of one or more
/// functions into a named generated artifact.
pub struct CodeGenerator {
    fname: String,
    with_header: bool,
    lines: Vec<String>,
}

impl CodeGenerator {
    /// Recognized options: `header` (bool, default true).
    pub fn new(fname: &str, opts: &Opts) -> Result<Self> {
        let mut with_header = true;
        for (key, val) in opts {
            match key.as_str() {
                "header" => match val {
                    OptVal::Bool(b) => with_header = *b,
                    _ => bail!("option 'header' must be a bool"),
                },
                _ => bail!("unrecognized option '{}'", key),
            }
        }
        Ok(CodeGenerator {
            fname: fname.to_string(),
            with_header,
            lines: Vec::new(),
        })
    }

    /// Append the lowered body of a function.
    pub fn add(&mut self, f: &Function) -> Result<()> {
        if !self.lines.is_empty() {
            self.lines.push(String::new());
        }
        f.node()?.codegen(self)
    }

    pub(crate) fn line(&mut self, s: String) {
        self.lines.push(s);
    }

    /// The full generated text.
    pub fn generate(&self) -> String {
        let mut out = String::new();
        if self.with_header {
            out.push_str(&format!("/* {} */\n", self.fname));
        }
        for l in &self.lines {
            out.push_str(l);
            out.push('\n');
        }
        out
    }
}
