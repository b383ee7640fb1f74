//! Top-level decompilation driver
//!
//! `FileDecompiler` owns one file's pipeline: decode, analysis passes,
//! prototype solving, reconstruction, cleanup, validation/repairs, printing
//! and the optional round trip. Every stage may fail; failures become
//! diagnostics and the driver always produces output, falling back to a
//! comment-only stub that is still a valid NSS file.

use crate::analysis::NodeAnalysis;
use crate::ast::{Ast, NodeId, NodeKind};
use crate::cleanup::cleanup_root;
use crate::config::Config;
use crate::error::{Diagnostic, DecompileError};
use crate::passes::{set_dead_code, set_destinations, set_positions, split_subroutines, SubTable};
use crate::printer::Printer;
use crate::proto::ProtoSolver;
use crate::repair::repair_all;
use crate::roundtrip::{self, Comparison};
use crate::state::{SubScript, SubScriptState};
use crate::validate::validate_script;
use crate::var::{VarId, VarTable};
use ncs_actions::{ActionsData, ActionsError};
use ncs_bytecode::{NcsReader, Program};

/// Driver return code
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    /// Round trip produced byte-identical output
    Success,
    /// Recompiled, but the bytes differ
    PartialCompare,
    /// Emitted source, but it was not (or could not be) recompiled
    PartialCompile,
    /// Could not reconstruct; the output is a diagnostic stub
    Failure,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "SUCCESS",
            Status::PartialCompare => "PARTIAL_COMPARE",
            Status::PartialCompile => "PARTIAL_COMPILE",
            Status::Failure => "FAILURE",
        }
    }
}

/// Everything the driver hands back for one file
#[derive(Debug)]
pub struct DecompileOutcome {
    pub status: Status,
    /// Always present; a stub when `status` is `Failure`
    pub source: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// One-file decompiler
///
/// Owns an immutable view of the action table and the configuration; no
/// process-wide state. Instances are independent.
pub struct FileDecompiler {
    config: Config,
    actions: Result<ActionsData, ActionsError>,
}

impl FileDecompiler {
    pub fn new(config: Config, actions: Result<ActionsData, ActionsError>) -> Self {
        Self { config, actions }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Decompile one NCS file to NSS source
    pub fn decompile(&self, bytes: &[u8]) -> DecompileOutcome {
        let mut diagnostics = Vec::new();

        let actions = match &self.actions {
            Ok(actions) => actions,
            Err(err) => {
                diagnostics.push(Diagnostic::new("driver", err.to_string()));
                return DecompileOutcome {
                    status: Status::Failure,
                    source: self.failure_stub(bytes, &[err.to_string()]),
                    diagnostics,
                };
            }
        };

        let program = match NcsReader::read(bytes) {
            Ok(program) => program,
            Err(err) => {
                let chain = vec![DecompileError::Decoder(err).to_string()];
                diagnostics.push(Diagnostic::new("decoder", chain[0].clone()));
                return DecompileOutcome {
                    status: Status::Failure,
                    source: self.failure_stub(bytes, &chain),
                    diagnostics,
                };
            }
        };

        // Structural analysis.
        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        diagnostics.extend(set_destinations(&program, &mut analysis));
        set_dead_code(&program, &mut analysis);
        let (mut subs, split_diags) = split_subroutines(&program, &analysis);
        diagnostics.extend(split_diags);

        // Prototype fixed point.
        let mut solver = ProtoSolver::new(&program, &analysis, Some(actions));
        diagnostics.extend(solver.solve(&mut subs, self.config.strict_signatures));

        // Reconstruction: globals frame first, then every body.
        let mut ast = Ast::new();
        let mut vars = VarTable::new();
        let (globals_root, globals_frame) =
            self.build_globals(&program, &analysis, &subs, actions, &mut ast, &mut vars, &mut diagnostics);

        let mut scripts: Vec<SubScript> = Vec::new();
        for id in subs.ids().collect::<Vec<_>>() {
            if subs.get(id).is_globals {
                continue;
            }
            let state = SubScriptState::new(
                &program,
                &analysis,
                &subs,
                Some(actions),
                &self.config,
                &mut ast,
                &mut vars,
                &globals_frame,
                id,
            );
            let (script, _, sub_diags) = state.replay();
            diagnostics.extend(sub_diags);
            scripts.push(script);
        }

        // Normalize, validate, repair.
        cleanup_root(&mut ast, &mut vars, &self.config, globals_root);
        for script in &scripts {
            cleanup_root(&mut ast, &mut vars, &self.config, script.root);
        }
        let had_violations = scripts
            .iter()
            .any(|s| !validate_script(&ast, &vars, s, &globals_frame).is_empty());
        if had_violations {
            diagnostics.extend(repair_all(
                &mut ast,
                &mut vars,
                &self.config.repairs,
                &scripts,
                &globals_frame,
            ));
            for script in &scripts {
                for violation in validate_script(&ast, &vars, script, &globals_frame) {
                    diagnostics.push(Diagnostic::new("validate", violation.to_string()));
                }
            }
        }

        // Print.
        let source = Printer::new(&ast, &mut vars, &subs).print(globals_root, &scripts);
        if source.trim().is_empty() && !program.instructions.is_empty() {
            let chain = vec![DecompileError::PrinterEmpty.to_string()];
            diagnostics.push(Diagnostic::new("printer", chain[0].clone()));
            return DecompileOutcome {
                status: Status::Failure,
                source: self.failure_stub(bytes, &chain),
                diagnostics,
            };
        }

        // Round trip.
        let status = match &self.config.compiler_path {
            Some(compiler) => {
                match roundtrip::recompile(compiler, &source, self.config.game) {
                    Ok(recompiled) => match roundtrip::compare_bytes(bytes, &recompiled) {
                        Comparison::Identical => Status::Success,
                        Comparison::SameLengthClass => {
                            diagnostics.push(Diagnostic::new(
                                "roundtrip",
                                format!(
                                    "recompiled output differs within one MOVSP ({} vs {} bytes)",
                                    recompiled.len(),
                                    bytes.len()
                                ),
                            ));
                            Status::PartialCompare
                        }
                        Comparison::Different => {
                            diagnostics.push(Diagnostic::new(
                                "roundtrip",
                                format!(
                                    "recompiled output diverges ({} vs {} bytes)",
                                    recompiled.len(),
                                    bytes.len()
                                ),
                            ));
                            Status::PartialCompare
                        }
                    },
                    Err(err) => {
                        diagnostics.push(Diagnostic::new("roundtrip", err.to_string()));
                        Status::PartialCompile
                    }
                }
            }
            None => {
                diagnostics.push(Diagnostic::new(
                    "roundtrip",
                    "no compiler configured; skipping byte comparison".to_string(),
                ));
                Status::PartialCompile
            }
        };

        DecompileOutcome {
            status,
            source,
            diagnostics,
        }
    }

    /// Header summary plus per-subroutine prototypes and the pcode listing
    pub fn info(&self, bytes: &[u8]) -> Result<String, DecompileError> {
        use std::fmt::Write;
        let program = NcsReader::read(bytes)?;
        let mut analysis = NodeAnalysis::new();
        set_positions(&program, &mut analysis);
        set_destinations(&program, &mut analysis);
        set_dead_code(&program, &mut analysis);
        let (mut subs, _) = split_subroutines(&program, &analysis);
        let mut solver = ProtoSolver::new(&program, &analysis, self.actions.as_ref().ok());
        solver.solve(&mut subs, false);

        let mut out = String::new();
        writeln!(out, "; {} bytes, {} instructions", bytes.len(), program.instructions.len()).unwrap();
        for sub in subs.iter() {
            let kind = if sub.is_globals {
                " (globals)"
            } else if sub.is_main {
                " (entry)"
            } else {
                ""
            };
            let params: Vec<String> = sub
                .params
                .iter()
                .map(|p| p.map(|t| t.keyword().to_string()).unwrap_or_else(|| "?".into()))
                .collect();
            writeln!(
                out,
                "; {} {}({}) at {:08X}..{:08X}{kind}",
                sub.return_type
                    .map(|t| t.keyword())
                    .unwrap_or("?"),
                sub.display_name(),
                params.join(", "),
                sub.start_offset,
                sub.end_offset,
            )
            .unwrap();
        }
        out.push('\n');
        out.push_str(&program.listing());
        Ok(out)
    }

    /// Replay the globals prologue, producing the globals declarations root
    /// and the frozen frame
    #[allow(clippy::too_many_arguments)]
    fn build_globals(
        &self,
        program: &Program,
        analysis: &NodeAnalysis,
        subs: &SubTable,
        actions: &ActionsData,
        ast: &mut Ast,
        vars: &mut VarTable,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> (NodeId, Vec<VarId>) {
        let Some(globals) = subs.globals() else {
            let root = ast.alloc(NodeKind::CodeBlock, 0);
            return (root, Vec::new());
        };
        // A prologue without SAVEBP is just the entry stub; there is no
        // globals frame and nothing in it should emit.
        let has_savebp = (globals.first.0..=globals.last.0)
            .filter_map(|i| program.get(ncs_bytecode::InstrId(i)))
            .any(|i| i.opcode == ncs_bytecode::Opcode::SaveBp);
        if !has_savebp {
            let root = ast.alloc(NodeKind::CodeBlock, 0);
            return (root, Vec::new());
        }
        let id = globals.id;
        let state = SubScriptState::new(
            program,
            analysis,
            subs,
            Some(actions),
            &self.config,
            ast,
            vars,
            &[],
            id,
        );
        let (script, frame, sub_diags) = state.replay();
        diagnostics.extend(sub_diags);
        (script.root, frame)
    }

    /// Comment-only stub emitted when reconstruction is impossible
    ///
    /// Includes the header bytes, the signature verdict, a size-based
    /// instruction estimate, the error chain, the active configuration and
    /// the action-table search trail, and closes with an empty `main` so
    /// the output still parses.
    fn failure_stub(&self, bytes: &[u8], errors: &[String]) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        writeln!(out, "// Decompilation failed; diagnostic stub follows.").unwrap();
        writeln!(out, "//").unwrap();

        let header: Vec<String> = bytes
            .iter()
            .take(16)
            .map(|b| format!("{b:02X}"))
            .collect();
        writeln!(out, "// File header: {}", header.join(" ")).unwrap();
        writeln!(out, "// File size: {} bytes", bytes.len()).unwrap();

        match NcsReader::read_header(bytes) {
            Ok(header) => {
                if header.signature_ok {
                    writeln!(out, "// NCS signature: ok (declared size {})", header.declared_size)
                        .unwrap();
                } else {
                    writeln!(out, "// Invalid NCS signature").unwrap();
                }
                let body = bytes.len().saturating_sub(ncs_bytecode::HEADER_LEN as usize);
                writeln!(out, "// Estimated instruction count: ~{}", body / 6).unwrap();
            }
            Err(err) => {
                writeln!(out, "// Invalid NCS signature").unwrap();
                writeln!(out, "// Header error: {err}").unwrap();
            }
        }

        writeln!(out, "//").unwrap();
        for err in errors {
            writeln!(out, "// Error: {err}").unwrap();
        }

        writeln!(out, "//").unwrap();
        writeln!(
            out,
            "// Configuration: game={}, prefer-switches={}, strict-signatures={}",
            self.config.game, self.config.prefer_switches, self.config.strict_signatures
        )
        .unwrap();

        if let Err(err) = &self.actions {
            writeln!(out, "//").unwrap();
            writeln!(out, "// ACTIONS DATA LOADING FAILURE").unwrap();
            if let ActionsError::TableNotFound { searched, .. } = err {
                for path in searched {
                    writeln!(out, "// Searched: {}", path.display()).unwrap();
                }
            }
            writeln!(out, "// Provide a table with --actions or place one next to the binary.")
                .unwrap();
        }

        writeln!(out, "\nvoid main() {{}}").unwrap();
        out
    }
}
