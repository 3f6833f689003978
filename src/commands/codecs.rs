use std::fmt::Write;

use crate::codec::Registry;

/// Command to list the codecs and preprocessors pixpress knows about
pub struct CodecsCommand {
    registry: Registry,
}

impl CodecsCommand {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn report(&self) -> String {
        let mut out = String::from("Codecs:\n");
        for codec in self.registry.codecs() {
            let _ = write!(
                out,
                "  --{:<8} .{:<5} defaults {}",
                codec.name(),
                codec.extension(),
                codec.default_options()
            );
            if let Some(auto) = codec.auto_optimize() {
                let _ = write!(
                    out,
                    ", auto tunes {} in [{}, {}]",
                    auto.option, auto.min, auto.max
                );
            }
            out.push('\n');
        }

        out.push_str("Preprocessors:\n");
        for pass in self.registry.preprocessors() {
            let _ = writeln!(out, "  --{:<8} defaults {}", pass.name(), pass.default_options());
        }
        let _ = writeln!(out, "Distance metric: {}", self.registry.metric().name());
        out
    }

    pub fn execute(&self) {
        print!("{}", self.report());
    }
}
